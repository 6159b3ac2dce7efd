#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Kubernetes-backed collaborators for the host-port policy controller.

mod program;
mod sweep;

pub use self::{
    program::{PodLookup, PodUpdater, PolicyProgrammer},
    sweep::{SweepMetrics, SweepSummary, Sweeper},
};
use std::future::Future;
use tokio::time;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("request timed out after {0:?}")]
    Timeout(time::Duration),

    #[error("{kind} {name} has no namespace")]
    MissingNamespace { kind: &'static str, name: String },
}

/// Bounds an API request by `timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: time::Duration, request: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, kube::Error>>,
{
    time::timeout(timeout, request)
        .await
        .map_err(|_| Error::Timeout(timeout))?
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn request_times_out() {
        let timeout = time::Duration::from_secs(5);
        let error = with_timeout(timeout, never_responds::<()>())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Timeout(t) if t == timeout));
        assert_eq!(error.to_string(), "request timed out after 5s");
    }

    #[tokio::test(start_paused = true)]
    async fn request_completes() {
        let timeout = time::Duration::from_secs(5);
        let value = with_timeout(timeout, async { Ok::<_, kube::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn missing_namespace() {
        let error = Error::MissingNamespace {
            kind: "Pod",
            name: "web-1".to_string(),
        };
        assert_eq!(error.to_string(), "Pod web-1 has no namespace");
    }

    async fn never_responds<T>() -> Result<T, kube::Error> {
        std::future::pending().await
    }
}
