use std::collections::{HashMap, HashSet};

use anyhow::Result;
use futures::StreamExt;
use kube::runtime::reflector::{self, store::Writer};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::client::kube_resources::Pod;
use crate::domain::marker::meta_namespace_key;

/// A pod change notification forwarded to the controller.
#[derive(Debug, Clone)]
pub enum PodEvent {
    Added(Pod),
    Updated(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Updated(pod) => pod,
        }
    }

    /// Queue key (`namespace/name`) of the pod this event is about
    pub fn key(&self) -> String {
        meta_namespace_key(self.pod())
    }
}

/// Turns raw watcher events into `PodEvent`s.
///
/// Tracks the last resourceVersion seen per pod: an apply for an unseen pod
/// is `Added`, an apply with a new resourceVersion is `Updated`, and an apply
/// repeating the last resourceVersion (e.g. after a relist) is dropped.
///
/// A relist (`Init` .. `InitDone`) replaces the tracked set: pods deleted
/// while the watch was down are not in it and are forgotten at `InitDone`.
#[derive(Debug, Default)]
pub struct PodEventClassifier {
    seen: HashMap<String, Option<String>>,
    /// Keys listed since the last `Init`, while a relist is in progress
    relisted: Option<HashSet<String>>,
}

impl PodEventClassifier {
    pub fn classify(&mut self, event: watcher::Event<Pod>) -> Option<PodEvent> {
        match event {
            watcher::Event::Apply(pod) | watcher::Event::InitApply(pod) => {
                let key = meta_namespace_key(&pod);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key.clone());
                }
                let version = pod.resource_version();
                match self.seen.insert(key.clone(), version.clone()) {
                    None => Some(PodEvent::Added(pod)),
                    Some(previous) if previous.is_some() && previous == version => {
                        debug!("Pod {} unchanged at resourceVersion {:?}", key, version);
                        None
                    }
                    Some(_) => Some(PodEvent::Updated(pod)),
                }
            }
            watcher::Event::Delete(pod) => {
                self.seen.remove(&meta_namespace_key(&pod));
                None
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    let before = self.seen.len();
                    self.seen.retain(|key, _| relisted.contains(key));
                    let pruned = before - self.seen.len();
                    if pruned > 0 {
                        debug!("Forgot {} pod(s) gone since the last list", pruned);
                    }
                }
                None
            }
        }
    }

    /// Number of pods currently tracked.
    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}

/// Watch pods, keep the reflector cache behind `writer` current, and forward
/// add/update notifications on `events` until `cancel` fires or the receiver
/// is dropped
pub async fn run_pod_watch(
    api: Api<Pod>,
    writer: Writer<Pod>,
    events: mpsc::Sender<PodEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let watcher_config = watcher::Config::default();

    info!("Starting Pod watcher...");

    let stream = watcher(api, watcher_config)
        .modify(|pod| {
            // Never read by the controller, and large
            pod.managed_fields_mut().clear();
        })
        .default_backoff();

    let mut stream = reflector::reflector(writer, stream).boxed();
    let mut classifier = PodEventClassifier::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if let Some(pod_event) = classifier.classify(event) {
                    debug!("Pod event: {:?} {}", event_kind(&pod_event), pod_event.key());
                    if events.send(pod_event).await.is_err() {
                        debug!("Pod event receiver dropped, stopping watcher");
                        break;
                    }
                }
            }
            Some(Err(e)) => {
                // Watcher will auto-reconnect with backoff
                error!("Pod watcher error: {:?}", e);
            }
            None => break,
        }
    }

    info!("Pod watcher stopped");
    Ok(())
}

fn event_kind(event: &PodEvent) -> &'static str {
    match event {
        PodEvent::Added(_) => "Added",
        PodEvent::Updated(_) => "Updated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, rv: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("ns".into());
        pod.metadata.name = Some(name.into());
        pod.metadata.resource_version = Some(rv.into());
        pod
    }

    #[test]
    fn test_first_apply_is_added_then_updated() {
        let mut classifier = PodEventClassifier::default();

        let first = classifier.classify(watcher::Event::InitApply(pod("web-1", "1")));
        assert!(matches!(first, Some(PodEvent::Added(_))));

        let second = classifier.classify(watcher::Event::Apply(pod("web-1", "2")));
        assert!(matches!(second, Some(PodEvent::Updated(_))));
        assert_eq!(second.unwrap().key(), "ns/web-1");
    }

    #[test]
    fn test_same_resource_version_is_ignored() {
        let mut classifier = PodEventClassifier::default();
        classifier.classify(watcher::Event::Apply(pod("web-1", "7")));

        assert!(classifier
            .classify(watcher::Event::Apply(pod("web-1", "7")))
            .is_none());
        // Relist delivers the same object again
        assert!(classifier
            .classify(watcher::Event::InitApply(pod("web-1", "7")))
            .is_none());
    }

    #[test]
    fn test_delete_is_not_forwarded_and_resets_tracking() {
        let mut classifier = PodEventClassifier::default();
        classifier.classify(watcher::Event::Apply(pod("web-1", "3")));

        assert!(classifier
            .classify(watcher::Event::Delete(pod("web-1", "4")))
            .is_none());

        let recreated = classifier.classify(watcher::Event::Apply(pod("web-1", "9")));
        assert!(matches!(recreated, Some(PodEvent::Added(_))));
    }

    #[test]
    fn test_relist_forgets_pods_deleted_while_disconnected() {
        let mut classifier = PodEventClassifier::default();
        classifier.classify(watcher::Event::Apply(pod("web-1", "1")));
        classifier.classify(watcher::Event::Apply(pod("web-2", "1")));
        assert_eq!(classifier.tracked(), 2);

        // Watch reconnects; web-2 was deleted in the meantime
        classifier.classify(watcher::Event::Init);
        assert!(classifier
            .classify(watcher::Event::InitApply(pod("web-1", "1")))
            .is_none());
        classifier.classify(watcher::Event::InitDone);

        assert_eq!(classifier.tracked(), 1);
        let recreated = classifier.classify(watcher::Event::Apply(pod("web-2", "5")));
        assert!(matches!(recreated, Some(PodEvent::Added(_))));
    }

    #[test]
    fn test_apply_during_relist_is_kept() {
        let mut classifier = PodEventClassifier::default();
        classifier.classify(watcher::Event::Init);
        classifier.classify(watcher::Event::InitApply(pod("web-1", "1")));
        classifier.classify(watcher::Event::Apply(pod("web-3", "2")));
        classifier.classify(watcher::Event::InitDone);
        assert_eq!(classifier.tracked(), 2);
    }

    #[test]
    fn test_init_markers_are_ignored() {
        let mut classifier = PodEventClassifier::default();
        assert!(classifier.classify(watcher::Event::Init).is_none());
        assert!(classifier.classify(watcher::Event::InitDone).is_none());
    }
}
