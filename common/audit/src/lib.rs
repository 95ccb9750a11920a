pub mod model;
pub mod producer;

pub use model::{AuditEvent, AuditActor, AuditError, AuditResult, AUDIT_EVENT_VERSION, AuditSeverity};
pub use producer::{AuditProducer, AuditProducerConfig, extract_actor_from_headers};
