use std::collections::HashMap;

use eddy_types::TaskInfo;
use prometheus::{IntCounter, Opts, Registry, TextEncoder};

fn counter_for_task(
    registry: Option<&Registry>,
    task_info: &TaskInfo,
    name: &'static str,
    help: &'static str,
) -> prometheus::Result<IntCounter> {
    let mut labels: HashMap<String, String> = HashMap::new();
    labels.extend(task_info.metric_label_map());
    let opts = Opts::new(name, help).const_labels(labels);

    let counter = IntCounter::with_opts(opts)?;
    if let Some(registry) = registry {
        registry.register(Box::new(counter.clone()))?;
    }
    Ok(counter)
}

/// Metrics for a single operation instance. Each context owns its registry; nothing is
/// registered globally, so independent operations in one process never collide.
#[derive(Clone)]
pub struct MetricsContext {
    registry: Option<Registry>,
    pub records_in: IntCounter,
    pub records_out: IntCounter,
    pub timers_fired: IntCounter,
    pub state_cleanups: IntCounter,
}

impl MetricsContext {
    pub fn new(task_info: &TaskInfo, enabled: bool) -> prometheus::Result<Self> {
        let registry = enabled.then(Registry::new);
        let r = registry.as_ref();
        Ok(MetricsContext {
            records_in: counter_for_task(r, task_info, "eddy_records_in", "input records")?,
            records_out: counter_for_task(r, task_info, "eddy_records_out", "change records emitted")?,
            timers_fired: counter_for_task(r, task_info, "eddy_timers_fired", "timers fired")?,
            state_cleanups: counter_for_task(
                r,
                task_info,
                "eddy_state_cleanups",
                "keys or windows whose state was cleared",
            )?,
            registry,
        })
    }

    pub fn enabled(&self) -> bool {
        self.registry.is_some()
    }

    /// Renders the registry in the prometheus text format; empty when disabled.
    pub fn gather(&self) -> String {
        let Some(registry) = &self.registry else {
            return String::new();
        };
        TextEncoder::new()
            .encode_to_string(&registry.gather())
            .unwrap_or_default()
    }
}
