pub mod audit;
pub mod privilege;
pub mod rate_limiter;

pub use audit::{AuditEvent, AuditKind, AuditLog, AuditQuery, CriticalSink, Severity};
pub use privilege::{Capability, PrivilegeProvider, StaticPrivilegeProvider};
pub use rate_limiter::{RateLimitDecision, RateLimitInfo, RateLimiter};
