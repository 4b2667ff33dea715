//! Service layer: rule handlers, CC limiting, IP policy, version lifecycle,
//! and the check orchestrator.

pub mod cc;
pub mod engine;
pub mod handler;
pub mod ip;
pub mod version;

pub use cc::CcService;
pub use engine::RuleEngine;
pub use handler::HandlerSet;
pub use ip::IpService;
pub use version::VersionService;
