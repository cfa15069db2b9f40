use std::future::Future;
use std::time::Duration;

use crate::{Error, Result};

/// Runs `fut` under an optional deadline, mapping expiry to a timeout error.
pub(crate) async fn with_deadline<F, T>(dur: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match dur {
        Some(dur) => match tokio::time::timeout(dur, fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::new_timeout()),
        },
        None => fut.await,
    }
}
