use std::io;

/// Every failure the reactor cannot recover from locally.
///
/// The variants carry the name of the operation that failed so the final
/// diagnostic line reads like `epoll add: Bad file descriptor`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{op}: {source}")]
    Engine {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("spawning detached worker: {0}")]
    Spawn(#[source] io::Error),
    #[error("encoding request body: {0}")]
    Body(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn os(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Os { op, source }
    }

    pub(crate) fn engine<E>(op: &'static str) -> impl FnOnce(E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        move |source| Error::Engine {
            op,
            source: Box::new(source),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
