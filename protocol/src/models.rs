use serde::{Deserialize, Serialize};

/// Public description of a selectable model.
///
/// The `id` is the stable handle clients use on the wire; vendor-specific
/// handles stay server-side and are never echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub available: bool,
    #[serde(rename = "contextLength")]
    pub context_length: u32,
}
