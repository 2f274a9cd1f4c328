//! How the relay (re)opens a channel to an endpoint.

use async_trait::async_trait;
use statescope_sdk::Port;

use crate::RelayError;

/// Opens a fresh port to one endpoint.
///
/// `attempt` is 0 for the initial connection and counts up from 1 for
/// reconnections. Implementations own whatever is needed to re-establish
/// the far side (for an in-process observer, handing it the other half of
/// a new [`Port::pair`]).
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, attempt: u32) -> Result<Port, RelayError>;
}

#[async_trait]
impl<F> Connector for F
where
    F: Fn(u32) -> Result<Port, RelayError> + Send + Sync,
{
    async fn connect(&self, attempt: u32) -> Result<Port, RelayError> {
        self(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn closures_are_connectors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let connector = move |attempt: u32| {
            c.fetch_add(1, Ordering::SeqCst);
            if attempt < 2 {
                Err(RelayError::Connect("refused".into()))
            } else {
                let (near, _far) = Port::pair();
                Ok(near)
            }
        };

        assert!(connector.connect(1).await.is_err());
        assert!(connector.connect(2).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
