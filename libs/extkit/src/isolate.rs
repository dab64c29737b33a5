//! Fault boundary for module code.
//!
//! Every piece of module code (hooks, bus handlers, scheduled jobs) runs in its
//! own task. A panic stays inside that task and comes back as [`Outcome::Panicked`].

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinError;

/// How a unit of module work ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    Ok,
    Failed(anyhow::Error),
    Panicked(String),
    TimedOut(Duration),
    Cancelled,
}

impl Outcome {
    pub(crate) fn describe(&self) -> String {
        match self {
            Outcome::Ok => "ok".to_string(),
            Outcome::Failed(e) => format!("{e:#}"),
            Outcome::Panicked(msg) => format!("panicked: {msg}"),
            Outcome::TimedOut(t) => format!("timed out after {t:?}"),
            Outcome::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Run `fut` on its own task, optionally bounded by `deadline`.
/// On timeout the task is aborted.
pub(crate) async fn run_isolated<F>(fut: F, deadline: Option<Duration>) -> Outcome
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    let joined = match deadline {
        Some(t) => match tokio::time::timeout(t, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Outcome::TimedOut(t);
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(())) => Outcome::Ok,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(e) => from_join_error(e),
    }
}

fn from_join_error(e: JoinError) -> Outcome {
    if !e.is_panic() {
        return Outcome::Cancelled;
    }
    let payload = e.into_panic();
    let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    Outcome::Panicked(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn panic_is_contained() {
        let out = run_isolated(
            async {
                if true {
                    panic!("boom");
                }
                Ok(())
            },
            None,
        )
        .await;
        match out {
            Outcome::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_is_reported() {
        let out = run_isolated(async { Err(anyhow::anyhow!("nope")) }, None).await;
        assert!(matches!(out, Outcome::Failed(ref e) if e.to_string() == "nope"));
    }

    #[tokio::test]
    async fn deadline_aborts_slow_work() {
        let out = run_isolated(
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            },
            Some(Duration::from_millis(20)),
        )
        .await;
        assert!(matches!(out, Outcome::TimedOut(_)));
    }
}
