//! Analysis orchestration and listener fan-out.
//!
//! `run_analysis` drives one analysis end to end; `notify` fans the
//! resulting report out to the listener modules selected by a filter.
//! Fan-out is only ever called with a report, so failed analyses never
//! notify anybody.

use crate::error::{AnalysisError, InputError, NotificationError, RunError};
use crate::grade;
use crate::models::{ProviderConfig, Report};
use crate::modules::{AnalysisModule, ListenerModule, ModuleRegistry};
use crate::polling::AnalysisContext;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Which listeners hear about a completed analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ListenerFilter {
    /// Every registered listener.
    #[default]
    All,
    /// Only listeners whose id is in the set.
    Only(BTreeSet<String>),
    /// Every listener whose id is not in the set.
    Except(BTreeSet<String>),
}

impl ListenerFilter {
    /// Build a filter from the optional `only` / `except` lists a transport
    /// receives. Supplying both is an input error.
    pub fn from_options(
        only: Option<Vec<String>>,
        except: Option<Vec<String>>,
    ) -> Result<Self, InputError> {
        match (only, except) {
            (Some(_), Some(_)) => Err(InputError::ConflictingListenerFilters),
            (Some(only), None) => Ok(ListenerFilter::Only(only.into_iter().collect())),
            (None, Some(except)) => Ok(ListenerFilter::Except(except.into_iter().collect())),
            (None, None) => Ok(ListenerFilter::All),
        }
    }

    /// Reject ids that name no known listener.
    pub fn validate<'a, I>(&self, known_ids: I) -> Result<(), InputError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let ids = match self {
            ListenerFilter::All => return Ok(()),
            ListenerFilter::Only(ids) | ListenerFilter::Except(ids) => ids,
        };

        let known: BTreeSet<&str> = known_ids.into_iter().collect();
        let unknown: Vec<String> = ids
            .iter()
            .filter(|id| !known.contains(id.as_str()))
            .cloned()
            .collect();

        if unknown.is_empty() {
            Ok(())
        } else {
            Err(InputError::UnknownListeners(unknown))
        }
    }

    pub fn accepts(&self, id: &str) -> bool {
        match self {
            ListenerFilter::All => true,
            ListenerFilter::Only(ids) => ids.contains(id),
            ListenerFilter::Except(ids) => !ids.contains(id),
        }
    }

    /// The listeners this filter selects, in registry order.
    pub fn resolve(&self, listeners: &[Arc<dyn ListenerModule>]) -> Vec<Arc<dyn ListenerModule>> {
        listeners
            .iter()
            .filter(|listener| self.accepts(listener.id()))
            .cloned()
            .collect()
    }
}

/// Result of notifying one listener.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationOutcome {
    pub listener: String,
    pub result: Result<(), NotificationError>,
}

impl NotificationOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Reject thresholds outside `[0, 100]`.
pub fn validate_threshold(threshold: Option<f64>) -> Result<(), InputError> {
    match threshold {
        Some(t) if !(grade::MIN_GRADE..=grade::MAX_GRADE).contains(&t) => {
            Err(InputError::InvalidThreshold(t))
        }
        _ => Ok(()),
    }
}

/// Run one analysis on `module`.
///
/// Suspends for as long as the provider needs, bounded by the deadline in
/// `ctx`. No report is returned unless the provider succeeded.
pub async fn run_analysis(
    module: &dyn AnalysisModule,
    config: &ProviderConfig,
    threshold: Option<f64>,
    ctx: &AnalysisContext,
) -> Result<Report, AnalysisError> {
    let span = info_span!("analysis", module = %module.id());

    async move {
        info!("Starting analysis");
        if let Some(deadline) = ctx.deadline() {
            debug!(
                "Deadline in {}s",
                deadline.saturating_duration_since(Instant::now()).as_secs()
            );
        }

        let outcome = ctx
            .backstop(module.start_analysis(config, threshold, ctx))
            .await
            .unwrap_or_else(|reason| {
                Err(AnalysisError::PollingTimeout {
                    attempts: 0,
                    reason,
                    last_status: None,
                })
            });

        match outcome {
            Ok(report) => {
                // providers may ignore the threshold; the caller's one is authoritative
                let report = report.with_threshold(threshold);
                info!(
                    "Analysis completed: {} {}",
                    report.analyzed_url(),
                    report.display_grade()
                );
                Ok(report)
            }
            Err(e) => {
                error!("Analysis failed: {}", e);
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

/// Notify every listener selected by `filter`, concurrently.
///
/// Waits for all of them and reports one outcome per listener; a failing
/// or panicking listener never affects the others.
pub async fn notify(
    report: Arc<Report>,
    listeners: &[Arc<dyn ListenerModule>],
    filter: &ListenerFilter,
) -> Vec<NotificationOutcome> {
    let selected = filter.resolve(listeners);
    if selected.is_empty() {
        return Vec::new();
    }

    let tasks = selected.into_iter().map(|listener| {
        let report = Arc::clone(&report);
        let id = listener.id().to_string();
        let span = info_span!("notify", listener = %id);
        let handle = tokio::spawn(
            async move { listener.notify_analysis_done(&report).await }.instrument(span),
        );
        async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(NotificationError::new(id.clone(), format!("task failed: {}", e))),
            };
            if let Err(ref e) = result {
                warn!("{}", e);
            }
            NotificationOutcome {
                listener: id,
                result,
            }
        }
    });

    join_all(tasks).await
}

/// Dispatches analyses and notifications against a module registry.
#[derive(Clone)]
pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
}

impl Orchestrator {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self { registry }
    }

    /// Validate caller input, then run the analysis module `module_id`.
    /// Unknown ids and out-of-range thresholds never reach a provider.
    pub async fn run_analysis(
        &self,
        module_id: &str,
        config: &ProviderConfig,
        threshold: Option<f64>,
        ctx: &AnalysisContext,
    ) -> Result<Report, RunError> {
        validate_threshold(threshold)?;
        let module = self.registry.analysis(module_id)?;
        Ok(run_analysis(module.as_ref(), config, threshold, ctx).await?)
    }

    /// Check a filter against the registered listener ids.
    pub fn validate_filter(&self, filter: &ListenerFilter) -> Result<(), InputError> {
        let listeners = self.registry.listeners();
        filter.validate(listeners.iter().map(|l| l.id()))
    }

    /// Fan a report out to the registered listeners selected by `filter`.
    pub async fn notify(
        &self,
        report: Arc<Report>,
        filter: &ListenerFilter,
    ) -> Result<Vec<NotificationOutcome>, InputError> {
        self.validate_filter(filter)?;
        let listeners = self.registry.listeners();
        Ok(notify(report, &listeners, filter).await)
    }
}
