//! Site watch: polls a list of pages and reports the ones whose content
//! changed since the previous run.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, FetchError, TaskError};
use crate::fetch::RetryingFetcher;
use crate::task::registry::{CommandSpec, TaskRegistration};
use crate::task::{RunBy, Task, TaskRuntime};

pub const TASK_KIND: &str = "site";
pub const WATCH_COMMAND: &str = "watch";

/// Persisted between runs.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchState {
    #[serde(default)]
    pub pages: BTreeMap<String, PageState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub fingerprint: String,
    pub status: u16,
    pub checked_at: DateTime<Utc>,
}

pub struct SiteWatch {
    urls: Arc<Vec<String>>,
    fetcher: RetryingFetcher,
}

#[async_trait]
impl Task for SiteWatch {
    async fn run(&mut self, rt: &TaskRuntime) -> Result<(), Error> {
        let mut state = WatchState::default();
        rt.store.load(&mut state).await?;

        let mut changed = Vec::new();
        let mut failed = 0usize;

        for url in self.urls.iter() {
            if rt.is_canceled() {
                return Err(TaskError::Canceled.into());
            }

            let response = match self.fetcher.get(url, rt.cancellation()).await {
                Ok(response) => response,
                Err(FetchError::Canceled) => return Err(TaskError::Canceled.into()),
                Err(e) => {
                    tracing::warn!(instance = %rt.instance_id, url = %url, "Fetch failed: {}", e);
                    failed += 1;
                    continue;
                }
            };

            let status = response.status().as_u16();
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(instance = %rt.instance_id, url = %url, "Reading page body failed: {}", e);
                    failed += 1;
                    continue;
                }
            };
            let fingerprint = format!("{:016x}", fnv1a(&body));

            let previous = state.pages.insert(
                url.clone(),
                PageState {
                    fingerprint: fingerprint.clone(),
                    status,
                    checked_at: Utc::now(),
                },
            );
            if previous.is_some_and(|p| p.fingerprint != fingerprint) {
                changed.push(url.clone());
            }
        }

        rt.store.save(&state).await?;

        if !changed.is_empty() {
            rt.notify(&format!("Pages changed:\n{}", changed.join("\n")))
                .await;
        } else if rt.run_by == RunBy::User {
            rt.notify(&format!(
                "No changes across {} page(s){}",
                self.urls.len() - failed,
                if failed > 0 {
                    format!(", {failed} unreachable")
                } else {
                    String::new()
                }
            ))
            .await;
        }

        if failed == self.urls.len() {
            return Err(TaskError::Failed {
                reason: format!("all {failed} page(s) unreachable"),
            }
            .into());
        }
        Ok(())
    }
}

/// Registration for the site watch task.
pub fn registration(urls: Vec<String>, fetcher: RetryingFetcher) -> TaskRegistration {
    let urls = Arc::new(urls);
    TaskRegistration::new(TASK_KIND, move |_, request| {
        if urls.is_empty() {
            return Err(TaskError::Construction {
                kind: request.task_kind.to_string(),
                command: request.command_kind.to_string(),
                reason: "no URLs configured (set TASKBOT_WATCH_URLS)".to_string(),
            });
        }
        Ok(Box::new(SiteWatch {
            urls: urls.clone(),
            fetcher: fetcher.clone(),
        }) as Box<dyn Task>)
    })
    .command(
        CommandSpec::exclusive(WATCH_COMMAND, "Check watched pages for changes")
            .with_result_data::<WatchState>(),
    )
}

/// 64-bit FNV-1a; stable across builds, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use reqwest::{Request, Response};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::fetch::{HttpExecutor, RetryPolicy};
    use crate::notify::RecordingNotifier;
    use crate::store::{ResultStore, TaskStore};
    use crate::task::{CommandKind, InstanceId, NotifierId, TaskContext, TaskKind};

    /// Serves whatever body is currently set, or 500 when unset.
    struct Page {
        body: Mutex<Option<String>>,
    }

    #[async_trait]
    impl HttpExecutor for Page {
        async fn execute(&self, _request: Request) -> Result<Response, reqwest::Error> {
            let body = self.body.lock().unwrap().clone();
            let response = match body {
                Some(body) => http::Response::builder().status(200).body(body),
                None => http::Response::builder().status(500).body(String::new()),
            }
            .unwrap();
            Ok(Response::from(response))
        }
    }

    fn runtime(dir: &TempDir, notifier: Arc<RecordingNotifier>, run_by: RunBy) -> TaskRuntime {
        let kind = TaskKind::from(TASK_KIND);
        let command = CommandKind::from(WATCH_COMMAND);
        TaskRuntime {
            task_kind: kind.clone(),
            command_kind: command.clone(),
            instance_id: InstanceId::from("t1"),
            notifier_id: NotifierId::from("chat"),
            run_by,
            context: TaskContext::new().with_task(kind.clone(), command.clone()),
            notifier,
            store: TaskStore::new(
                Arc::new(ResultStore::new("test", dir.path().to_path_buf())),
                kind,
                command,
                None,
            ),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    fn watcher(page: Arc<Page>) -> SiteWatch {
        SiteWatch {
            urls: Arc::new(vec!["http://example.test/".to_string()]),
            fetcher: RetryingFetcher::new(
                page,
                RetryPolicy {
                    max_retries: 1,
                    min_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(1),
                },
            ),
        }
    }

    #[tokio::test]
    async fn change_is_reported_on_second_run() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let page = Arc::new(Page {
            body: Mutex::new(Some("v1".to_string())),
        });

        let rt = runtime(&dir, notifier.clone(), RunBy::Scheduler);
        watcher(page.clone()).run(&rt).await.unwrap();
        assert!(notifier.notifications().is_empty());

        *page.body.lock().unwrap() = Some("v2".to_string());
        watcher(page.clone()).run(&rt).await.unwrap();
        let changed = notifier.matching("Pages changed");
        assert_eq!(changed.len(), 1);
        assert!(changed[0].message.contains("http://example.test/"));

        let mut state = WatchState::default();
        assert!(rt.store.load(&mut state).await.unwrap());
        assert_eq!(state.pages.len(), 1);
    }

    #[tokio::test]
    async fn user_run_reports_no_changes() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let page = Arc::new(Page {
            body: Mutex::new(Some("same".to_string())),
        });

        let rt = runtime(&dir, notifier.clone(), RunBy::User);
        watcher(page.clone()).run(&rt).await.unwrap();
        watcher(page).run(&rt).await.unwrap();
        assert_eq!(notifier.matching("No changes").len(), 2);
    }

    #[tokio::test]
    async fn unreachable_pages_fail_the_run() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let page = Arc::new(Page {
            body: Mutex::new(None),
        });

        let rt = runtime(&dir, notifier, RunBy::Scheduler);
        let err = watcher(page).run(&rt).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::Failed { .. })));
    }

    #[tokio::test]
    async fn canceled_runtime_stops_before_fetching() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let page = Arc::new(Page {
            body: Mutex::new(Some("v1".to_string())),
        });

        let rt = runtime(&dir, notifier, RunBy::User);
        rt.cancel.cancel();
        let err = watcher(page).run(&rt).await.unwrap_err();
        assert!(matches!(err, Error::Task(TaskError::Canceled)));
    }

    /// Serves `v1` everywhere except URLs containing `broken`, whose body
    /// stream fails after the headers arrive.
    struct DroppingPage;

    #[async_trait]
    impl HttpExecutor for DroppingPage {
        async fn execute(&self, request: Request) -> Result<Response, reqwest::Error> {
            let body = if request.url().as_str().contains("broken") {
                reqwest::Body::wrap_stream(futures::stream::iter(vec![
                    Ok::<Vec<u8>, std::io::Error>(b"partial".to_vec()),
                    Err(std::io::Error::other("connection reset")),
                ]))
            } else {
                reqwest::Body::from("v1")
            };
            Ok(Response::from(http::Response::new(body)))
        }
    }

    #[tokio::test]
    async fn broken_body_counts_as_one_unreachable_page() {
        let dir = TempDir::new().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let rt = runtime(&dir, notifier.clone(), RunBy::User);

        let mut watch = SiteWatch {
            urls: Arc::new(vec![
                "http://broken.test/".to_string(),
                "http://ok.test/".to_string(),
            ]),
            fetcher: RetryingFetcher::new(Arc::new(DroppingPage), RetryPolicy::default()),
        };
        watch.run(&rt).await.unwrap();

        let mut state = WatchState::default();
        assert!(rt.store.load(&mut state).await.unwrap());
        assert!(state.pages.contains_key("http://ok.test/"));
        assert!(!state.pages.contains_key("http://broken.test/"));
        assert_eq!(notifier.matching("1 unreachable").len(), 1);
    }

    #[test]
    fn fnv1a_known_values() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
