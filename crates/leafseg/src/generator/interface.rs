use crate::Result;

/// Type name under which segment generators are exposed to sharding rules.
pub const LEAF_SEGMENT: &str = "LEAF_SEGMENT";

/// A pluggable key-generation strategy.
pub trait KeyGenerator: Send + Sync {
    /// The fixed identifier a sharding rule uses to select this strategy.
    fn type_name(&self) -> &'static str;

    /// Returns the next key.
    ///
    /// # Errors
    ///
    /// Implementation specific; see the implementor.
    fn generate(&self) -> Result<u64>;
}
