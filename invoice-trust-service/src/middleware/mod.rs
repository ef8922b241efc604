pub mod internal;
pub mod tenant;

pub use internal::internal_key_middleware;
pub use tenant::TenantContext;
