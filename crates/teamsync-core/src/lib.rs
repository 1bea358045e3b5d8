//! # teamsync-core
//!
//! Core types shared by every teamsync crate: validated identifiers, the
//! authoritative team/user/role model, audit records and role-based
//! authorization.
//!
//! This crate performs no I/O.

pub mod audit;
pub mod authz;
mod error;
pub mod id;
pub mod model;

pub use audit::{AuditAction, AuditRecord, AuditTarget, ComponentName, TargetKind};
pub use authz::{Authorization, AuthzError, authorize};
pub use error::{CoreError, Result};
pub use id::{CorrelationId, ReconcilerName, Slug, UserId, normalize_email};
pub use model::{
    DEFAULT_ROLES, Member, NewTeam, NewUser, Principal, ReconcilerDescriptor, ReconcilerError,
    ReconcilerRegistration, RoleAssignment, RoleName, ServiceAccount, Team, TeamRole, TeamUpdate,
    User,
};
