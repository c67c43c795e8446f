//! Module contract and registry.
//!
//! A module is one of three capability variants, each an independent
//! trait over the shared `Module` identity:
//! - `AnalysisModule` runs an analysis and returns a `Report`.
//! - `ListenerModule` is told about every successful analysis.
//! - `ServerModule` exposes the analysis modules over a transport.
//!
//! The registry is built once by the loader and only read afterwards.

use crate::error::{AnalysisError, InputError, NotificationError, RegistryError, ServerError};
use crate::models::{ModuleDescriptor, ModuleKind, ProviderConfig, Report};
use crate::polling::AnalysisContext;
use crate::server::{CorsConfig, ServerHandle};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identity shared by every module variant.
pub trait Module: Send + Sync {
    fn descriptor(&self) -> &ModuleDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

/// A provider that can analyze a target.
#[async_trait]
pub trait AnalysisModule: Module {
    /// Run one analysis. Implementations backed by a remote job drive a
    /// `PollingSession` bound to `ctx`.
    async fn start_analysis(
        &self,
        config: &ProviderConfig,
        threshold: Option<f64>,
        ctx: &AnalysisContext,
    ) -> Result<Report, AnalysisError>;
}

/// A sink notified after each successful analysis.
#[async_trait]
pub trait ListenerModule: Module {
    async fn notify_analysis_done(&self, report: &Report) -> Result<(), NotificationError>;
}

/// A transport exposing analysis modules.
#[async_trait]
pub trait ServerModule: Module {
    async fn start_server(
        &self,
        analysis_modules: Vec<Arc<dyn AnalysisModule>>,
        listener_modules: Vec<Arc<dyn ListenerModule>>,
        port: u16,
        cors: Option<CorsConfig>,
    ) -> Result<ServerHandle, ServerError>;
}

/// A module tagged with the one variant it implements.
#[derive(Clone)]
pub enum RegisteredModule {
    Analysis(Arc<dyn AnalysisModule>),
    Listener(Arc<dyn ListenerModule>),
    Server(Arc<dyn ServerModule>),
}

impl RegisteredModule {
    pub fn kind(&self) -> ModuleKind {
        match self {
            RegisteredModule::Analysis(_) => ModuleKind::Analysis,
            RegisteredModule::Listener(_) => ModuleKind::Listener,
            RegisteredModule::Server(_) => ModuleKind::Server,
        }
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        match self {
            RegisteredModule::Analysis(m) => m.descriptor(),
            RegisteredModule::Listener(m) => m.descriptor(),
            RegisteredModule::Server(m) => m.descriptor(),
        }
    }
}

/// Immutable mapping from module id to module.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, RegisteredModule>,
}

impl ModuleRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Build a registry from plain module lists.
    pub fn from_modules(
        analysis_modules: Vec<Arc<dyn AnalysisModule>>,
        listener_modules: Vec<Arc<dyn ListenerModule>>,
    ) -> Result<Self, RegistryError> {
        let mut builder = Self::builder();
        for module in analysis_modules {
            builder = builder.analysis(module)?;
        }
        for module in listener_modules {
            builder = builder.listener(module)?;
        }
        Ok(builder.build())
    }

    /// Look up an analysis module. Unknown ids are caller errors.
    pub fn analysis(&self, id: &str) -> Result<Arc<dyn AnalysisModule>, InputError> {
        match self.modules.get(id) {
            Some(RegisteredModule::Analysis(module)) => Ok(Arc::clone(module)),
            _ => Err(InputError::UnknownAnalysisModule(id.to_string())),
        }
    }

    pub fn server(&self, id: &str) -> Result<Arc<dyn ServerModule>, InputError> {
        match self.modules.get(id) {
            Some(RegisteredModule::Server(module)) => Ok(Arc::clone(module)),
            _ => Err(InputError::UnknownServerModule(id.to_string())),
        }
    }

    pub fn analysis_modules(&self) -> Vec<Arc<dyn AnalysisModule>> {
        self.modules
            .values()
            .filter_map(|m| match m {
                RegisteredModule::Analysis(module) => Some(Arc::clone(module)),
                _ => None,
            })
            .collect()
    }

    pub fn listeners(&self) -> Vec<Arc<dyn ListenerModule>> {
        self.modules
            .values()
            .filter_map(|m| match m {
                RegisteredModule::Listener(module) => Some(Arc::clone(module)),
                _ => None,
            })
            .collect()
    }

    /// Descriptors of every module, ordered by id.
    pub fn descriptors(&self) -> Vec<&ModuleDescriptor> {
        self.modules.values().map(|m| m.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Explicit registration step producing a `ModuleRegistry`.
#[derive(Default)]
pub struct RegistryBuilder {
    modules: BTreeMap<String, RegisteredModule>,
}

impl RegistryBuilder {
    pub fn register(mut self, module: RegisteredModule) -> Result<Self, RegistryError> {
        let descriptor = module.descriptor();
        if descriptor.kind != module.kind() {
            return Err(RegistryError::KindMismatch {
                id: descriptor.id.clone(),
                declared: descriptor.kind.to_string(),
                registered: module.kind().to_string(),
            });
        }

        let id = descriptor.id.clone();
        if self.modules.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        self.modules.insert(id, module);
        Ok(self)
    }

    pub fn analysis(self, module: Arc<dyn AnalysisModule>) -> Result<Self, RegistryError> {
        self.register(RegisteredModule::Analysis(module))
    }

    pub fn listener(self, module: Arc<dyn ListenerModule>) -> Result<Self, RegistryError> {
        self.register(RegisteredModule::Listener(module))
    }

    pub fn server(self, module: Arc<dyn ServerModule>) -> Result<Self, RegistryError> {
        self.register(RegisteredModule::Server(module))
    }

    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            modules: self.modules,
        }
    }
}

/// In-memory modules shared by the unit tests of several files.
#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::models::{ReportParams, Service};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub fn report(grade: &str, threshold: Option<f64>) -> Report {
        Report::new(ReportParams {
            analyzed_url: "https://example.com".to_string(),
            date: Utc::now(),
            grade: grade.to_string(),
            normalized_grade: None,
            raw_result: serde_json::json!({ "grade": grade }),
            result_url: None,
            service: Service::new("Fake"),
            threshold,
        })
    }

    /// Analysis module returning a fixed grade, or failing.
    pub struct FakeAnalysis {
        descriptor: ModuleDescriptor,
        grade: Option<String>,
        date: Option<DateTime<Utc>>,
        pub calls: AtomicUsize,
    }

    impl FakeAnalysis {
        pub fn new(id: &str, grade: &str) -> Self {
            Self {
                descriptor: ModuleDescriptor::new(
                    id,
                    format!("Fake {}", id),
                    Service::new("Fake"),
                    ModuleKind::Analysis,
                ),
                grade: Some(grade.to_string()),
                date: None,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn failing(id: &str) -> Self {
            Self {
                grade: None,
                ..Self::new(id, "0")
            }
        }

        pub fn with_date(mut self, date: DateTime<Utc>) -> Self {
            self.date = Some(date);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Module for FakeAnalysis {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }
    }

    #[async_trait]
    impl AnalysisModule for FakeAnalysis {
        async fn start_analysis(
            &self,
            config: &ProviderConfig,
            threshold: Option<f64>,
            _ctx: &AnalysisContext,
        ) -> Result<Report, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let grade = self
                .grade
                .clone()
                .ok_or_else(|| AnalysisError::provider("Fake", "upstream outage"))?;

            Ok(Report::new(ReportParams {
                analyzed_url: config
                    .get("url")
                    .and_then(|v| v.as_str())
                    .unwrap_or("https://example.com")
                    .to_string(),
                date: self.date.unwrap_or_else(Utc::now),
                grade,
                normalized_grade: None,
                raw_result: serde_json::Value::Object(config.clone()),
                result_url: None,
                service: self.descriptor.service.clone(),
                threshold,
            }))
        }
    }

    /// Listener recording the URLs it was notified about.
    pub struct FakeListener {
        descriptor: ModuleDescriptor,
        fail: bool,
        delay: Option<std::time::Duration>,
        pub seen: Mutex<Vec<String>>,
    }

    impl FakeListener {
        pub fn new(id: &str) -> Self {
            Self {
                descriptor: ModuleDescriptor::new(
                    id,
                    format!("Fake listener {}", id),
                    Service::new("Fake"),
                    ModuleKind::Listener,
                ),
                fail: false,
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(id: &str) -> Self {
            Self {
                fail: true,
                ..Self::new(id)
            }
        }

        /// Records the report only after `delay` has elapsed.
        pub fn slow(id: &str, delay: std::time::Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::new(id)
            }
        }

        pub fn notified(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    impl Module for FakeListener {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.descriptor
        }
    }

    #[async_trait]
    impl ListenerModule for FakeListener {
        async fn notify_analysis_done(&self, report: &Report) -> Result<(), NotificationError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.seen
                .lock()
                .unwrap()
                .push(report.analyzed_url().to_string());
            if self.fail {
                Err(NotificationError::new(self.id(), "channel not found"))
            } else {
                Ok(())
            }
        }
    }
}
