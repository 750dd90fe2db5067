//! Warden Inspect - Packet inspector pipeline
//!
//! Inspectors are registered once with a name and an order key. Each
//! connection gets an [`InspectionSession`] that builds the inspectors from
//! the first packet and feeds them every packet after that, lowest order
//! first, while the connection still passes traffic.
//!
//! ```text
//!  InspectorRegistry ──session()──► InspectionSession (one per connection)
//!   ├─ Encryption Detection (0)        ├─ handle_packet(&mut conn, &packet)
//!   └─ ...                             └─ finish() / drop ─► destroy()
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod encryption;
pub mod error;
pub mod registry;
pub mod session;

pub use encryption::EncryptionDetector;
pub use error::{InspectError, Result};
pub use registry::{Inspector, InspectorFactory, InspectorRegistry, Registration};
pub use session::{ConnectionSaver, InspectionSession, PipelineStats};

/// Registry with the built-in inspectors registered
pub fn default_registry(config: &warden_common::InspectionConfig) -> Result<InspectorRegistry> {
    let mut registry = InspectorRegistry::new(config);
    encryption::register(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::{InspectionConfig, WardenError};

    #[test]
    fn test_default_registry_honours_disabled() {
        let registry = default_registry(&InspectionConfig::default()).unwrap();
        assert_eq!(registry.names(), vec![encryption::NAME]);

        let config = InspectionConfig {
            disabled: vec![encryption::NAME.to_string()],
            ..InspectionConfig::default()
        };
        assert!(default_registry(&config).unwrap().is_empty());
    }

    #[test]
    fn test_error_converts_to_shared_type() {
        let err = InspectError::Duplicate(encryption::NAME.into());
        assert_eq!(
            WardenError::from(err),
            WardenError::Inspector {
                name: encryption::NAME.into(),
                message: "inspector Encryption Detection is already registered".into(),
            }
        );
    }
}
