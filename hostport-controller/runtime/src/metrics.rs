use hostport_controller_core::SyncOutcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct SyncMetrics {
    syncs: Family<SyncLabels, Counter>,
    requeues: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SyncLabels {
    outcome: String,
}

// === impl SyncMetrics ===

impl SyncMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let syncs = Family::default();
        prom.register(
            "syncs",
            "Count of pod syncs by outcome; a sync that labels a pod and programs its policy counts toward both",
            syncs.clone(),
        );

        let requeues = Counter::default();
        prom.register(
            "requeues",
            "Count of pod syncs retried after a failure",
            requeues.clone(),
        );

        Self { syncs, requeues }
    }

    pub(crate) fn synced(&self, outcome: SyncOutcome) {
        if outcome.skipped {
            return self.inc("skipped");
        }
        if outcome.labeled {
            self.inc("labeled");
        }
        if outcome.programmed {
            self.inc("programmed");
        }
        if !outcome.labeled && !outcome.programmed {
            self.inc("unchanged");
        }
    }

    pub(crate) fn failed(&self) {
        self.inc("failed");
    }

    pub(crate) fn requeued(&self) {
        self.requeues.inc();
    }

    fn inc(&self, outcome: &str) {
        self.syncs
            .get_or_create(&SyncLabels {
                outcome: outcome.to_string(),
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, outcome: &str) -> u64 {
        self.syncs
            .get_or_create(&SyncLabels {
                outcome: outcome.to_string(),
            })
            .get()
    }

    #[cfg(test)]
    pub(crate) fn requeue_count(&self) -> u64 {
        self.requeues.get()
    }
}
