//! Signing capability

use async_trait::async_trait;

use crate::error::KeyError;
use crate::typed_data::TypedData;
use crate::types::{Address, Signature};

/// A `sign(payload) -> signature` capability.
///
/// Components that need signatures hold an `Arc<dyn Signer>` and never the
/// key itself. A locally generated session key and an external wallet
/// provider are interchangeable behind this trait.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address that recovers from this signer's signatures
    fn address(&self) -> Address;

    /// Sign `keccak256(payload)`
    async fn sign_payload(&self, payload: &[u8]) -> Result<Signature, KeyError>;

    /// Sign EIP-712 structured data
    async fn sign_typed_data(&self, data: &TypedData) -> Result<Signature, KeyError>;
}
