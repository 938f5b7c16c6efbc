//! Error types for the layer composition engine.

use thiserror::Error;

use crate::access::AccessType;

/// Result type alias for layer composition operations.
pub type LayerResult<T> = Result<T, LayerError>;

/// Error variants for layer composition, snapshot synthesis and deletion reconciliation.
///
/// Errors carry owned strings only so that they can be cloned into failure maps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    /// A capability check failed.
    #[error("access denied: {identity} needs {required} on {object}")]
    AccessDenied {
        /// Identity of the access context that was checked.
        identity: String,
        /// Description of the protected object.
        object: String,
        /// The access level that was required.
        required: AccessType,
    },

    /// Internal-consistency fault. The cluster state is inconsistent and an
    /// upstream stage (placement, flag management) is broken.
    #[error("implementation error: {reason}")]
    ImplementationError {
        /// Description of the violated invariant.
        reason: String,
    },

    /// A storage pool driver reported an error for one resource.
    #[error("storage fault in pool {pool}: {reason}")]
    StorageFault {
        /// Name of the storage pool that reported the error.
        pool: String,
        /// Error reported by the driver.
        reason: String,
    },

    /// A stored property value could not be parsed.
    #[error("malformed property {key}={value:?}: expected {expected}")]
    PropertyFormat {
        /// Fully qualified property key.
        key: String,
        /// The raw stored value.
        value: String,
        /// Name of the expected type.
        expected: String,
    },

    /// Not enough peer slots for the resources realizing a definition.
    #[error("insufficient peer slots for {rsc_name}: {peer_slots} slots, {resource_count} resources")]
    InsufficientPeerSlots {
        /// Resource definition name.
        rsc_name: String,
        /// Configured or default peer-slot count.
        peer_slots: u16,
        /// Number of resources realizing the definition.
        resource_count: usize,
    },

    /// A number pool has no free number left in its range.
    #[error("number pool {pool} exhausted")]
    PoolExhausted {
        /// Name of the exhausted pool.
        pool: String,
    },

    /// An entity was looked up that does not exist in the model.
    #[error("not found: {what}")]
    NotFound {
        /// Description of the missing entity.
        what: String,
    },

    /// Engine configuration could not be loaded.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },
}

impl LayerError {
    /// Shorthand for an internal-consistency fault.
    pub fn implementation(reason: impl Into<String>) -> Self {
        LayerError::ImplementationError {
            reason: reason.into(),
        }
    }

    /// Returns true if this error must abort the whole reconciliation pass.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LayerError::AccessDenied { .. }
                | LayerError::ImplementationError { .. }
                | LayerError::PoolExhausted { .. }
                | LayerError::NotFound { .. }
                | LayerError::Config { .. }
        )
    }

    /// Returns true if this error is scoped to a single resource and is
    /// recorded instead of aborting the pass.
    pub fn is_per_resource(&self) -> bool {
        !self.is_fatal()
    }
}
