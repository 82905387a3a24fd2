pub mod content;
pub mod rate_limiter;
pub mod validator;

pub use rate_limiter::{RateLimitStats, RateLimiter, Reservation};
pub use validator::{OpenRelationships, RelationshipLookup, SecurityValidator, ValidationResult};
