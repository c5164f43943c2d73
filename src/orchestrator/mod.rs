//! Orchestration façade.
//!
//! Composes the rest of the crate for one analysis: resolve target engines,
//! build prompts, fan out through the [`EngineInvoker`] with each engine's
//! output feeding the session's stream, synthesize a report, and store it
//! in the response cache.

pub mod prompt;
pub mod registry;
pub mod report;

pub use prompt::{AnalysisTarget, DefaultPromptBuilder, PromptBuilder};
pub use registry::{ActiveAnalysis, AnalysisGuard, AnalysisRegistry};
pub use report::{EngineSection, SynthesizedReport, render_markdown};

use crate::analysis::AnalysisType;
use crate::cache::{Owner, Page, ResponseCache, cache_key, paginate};
use crate::config::Settings;
use crate::engines::{EngineInvoker, EngineSelection, ExecutionRequest};
use crate::errors::{CacheError, OrchestratorError};
use crate::runner::ResourceLimits;
use crate::stream::StreamPipeline;
use futures::future::join_all;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the caller wants analysed, and how.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub analysis: AnalysisType,
    pub target: AnalysisTarget,
    pub context: Option<String>,
    pub engines: EngineSelection,
    pub session_id: Option<String>,
    pub working_dir: PathBuf,
    /// Overrides the configured execution timeout.
    pub timeout: Option<Duration>,
    /// Skip the cache lookup and re-run the engines.
    pub refresh: bool,
}

impl AnalysisRequest {
    pub fn new(analysis: AnalysisType, target: AnalysisTarget, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            analysis,
            target,
            context: None,
            engines: EngineSelection::All,
            session_id: None,
            working_dir: working_dir.into(),
            timeout: None,
            refresh: false,
        }
    }

    pub fn with_engines(mut self, engines: EngineSelection) -> Self {
        self.engines = engines;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Fields identifying the work, for the cache key.
    pub fn cache_fields(&self) -> Value {
        let engines = match &self.engines {
            EngineSelection::All => "all".to_string(),
            EngineSelection::Single(id) => id.clone(),
        };
        json!({
            "analysis": self.analysis.as_str(),
            "target": self.target.content,
            "label": self.target.label,
            "context": self.context,
            "engines": engines,
            "refresh": self.refresh,
        })
    }
}

/// Entry point for running analyses.
pub struct Orchestrator {
    invoker: Arc<EngineInvoker>,
    pipeline: Arc<StreamPipeline>,
    cache: Arc<ResponseCache>,
    prompts: Arc<dyn PromptBuilder>,
    analyses: AnalysisRegistry,
    limits: ResourceLimits,
    host_engine: Option<String>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("invoker", &self.invoker)
            .field("limits", &self.limits)
            .field("host_engine", &self.host_engine)
            .field("active", &self.analyses.len())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(invoker: Arc<EngineInvoker>, pipeline: Arc<StreamPipeline>, cache: Arc<ResponseCache>) -> Self {
        Self {
            invoker,
            pipeline,
            cache,
            prompts: Arc::new(DefaultPromptBuilder),
            analyses: AnalysisRegistry::new(),
            limits: ResourceLimits::default(),
            host_engine: None,
        }
    }

    /// Wire every component from resolved settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let invoker = EngineInvoker::new(
            Arc::new(settings.engine_registry()),
            settings.runner(),
            settings.gate(),
            settings.breaker_config(),
        );
        let pipeline = StreamPipeline::new(settings.throttle_buffer());
        let cache = ResponseCache::new(settings.cache_config());
        let mut orchestrator = Self::new(Arc::new(invoker), Arc::new(pipeline), Arc::new(cache))
            .with_limits(settings.resource_limits());
        orchestrator.host_engine = settings.engines.host_engine.clone();
        orchestrator
    }

    pub fn with_prompt_builder(mut self, prompts: Arc<dyn PromptBuilder>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_host_engine(mut self, host: Option<String>) -> Self {
        self.host_engine = host;
        self
    }

    /// Start the pipeline ticker and cache sweeper. Requires a runtime.
    pub fn start_background_tasks(&self) {
        self.pipeline.start_ticker();
        self.cache.start_sweeper();
    }

    pub fn invoker(&self) -> &Arc<EngineInvoker> {
        &self.invoker
    }

    pub fn pipeline(&self) -> &Arc<StreamPipeline> {
        &self.pipeline
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn active_analyses(&self) -> Vec<ActiveAnalysis> {
        self.analyses.active()
    }

    /// Run one analysis.
    ///
    /// Succeeds when at least one engine produced output; failed engines are
    /// listed on the report. A stored report for the same work is returned
    /// instead unless the request asks for a refresh.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<SynthesizedReport, OrchestratorError> {
        let session = request.session_id.as_deref();
        let fields = request.cache_fields();

        if !request.refresh
            && let Some(report) = self.cached_report(&fields, session)?
        {
            info!(session_id = ?session, cache_id = ?report.cache_id, "serving analysis from cache");
            return Ok(report);
        }

        let runner = self.invoker.runner().clone();
        let targets = self
            .invoker
            .registry()
            .resolve_targets(&runner, &request.engines, self.host_engine.as_deref())
            .await?;

        let stream_session = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if !self.pipeline.is_open(&stream_session) {
            // Subscribers may have opened it already to watch progress.
            let _ = self.pipeline.open_session(&stream_session, request.analysis);
        }
        let _guard = self.analyses.register(session, request.analysis, &targets);
        info!(session_id = %stream_session, analysis = %request.analysis, engines = ?targets, "starting analysis");

        let limits = ResourceLimits {
            timeout: request.timeout.unwrap_or(self.limits.timeout),
            ..self.limits.clone()
        };
        let system_prompt = self.prompts.system_prompt(request.analysis);
        let user_prompt = self
            .prompts
            .user_prompt(request.analysis, &request.target, request.context.as_deref());
        let work_key = cache_key(&fields);

        let started = Instant::now();
        let executions: Vec<_> = targets
            .iter()
            .map(|engine| {
                let exec = ExecutionRequest::new(engine, user_prompt.clone(), request.working_dir.clone())
                    .with_system_prompt(system_prompt.clone())
                    .with_limits(limits.clone())
                    .with_session(stream_session.clone())
                    .with_request_id(format!("{}:{}", work_key, engine));
                let sink = self.invoker.registry().get(engine).map(|spec| {
                    self.pipeline.sink(&stream_session, engine, spec.convention)
                });
                async move { self.invoker.execute(&exec, sink).await }
            })
            .collect();
        let results = join_all(executions).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let synthesized = SynthesizedReport::synthesize(
            request.analysis,
            &request.target.label,
            session,
            results,
            elapsed_ms,
        );
        let mut report = match synthesized {
            Ok(report) => {
                self.pipeline.close_session(&stream_session, None);
                report
            }
            Err(e) => {
                self.pipeline.close_session(&stream_session, Some(&e.user_message()));
                return Err(e);
            }
        };

        match serde_json::to_string(&report) {
            Ok(body) => match self.cache.set(&fields, &body, Owner::from_session(session)) {
                Ok(stored) => report.cache_id = Some(stored.opaque_id),
                Err(CacheError::EntryTooLarge { size, limit }) => {
                    warn!(size, limit, "report too large to cache");
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) => warn!(error = %e, "failed to serialize report for caching"),
        }

        info!(
            session_id = %stream_session,
            succeeded = report.sections.len(),
            failed = report.failures.len(),
            elapsed_ms,
            "analysis finished"
        );
        Ok(report)
    }

    fn cached_report(&self, fields: &Value, session: Option<&str>) -> Result<Option<SynthesizedReport>, OrchestratorError> {
        let Some(id) = self.cache.lookup(fields, session) else {
            return Ok(None);
        };
        self.stored_report(&id, session)
    }

    /// A previously stored report, if `session` may read it.
    pub fn stored_report(&self, id: &str, session: Option<&str>) -> Result<Option<SynthesizedReport>, OrchestratorError> {
        let Some(body) = self.cache.get(id, session)? else {
            return Ok(None);
        };
        match serde_json::from_str::<SynthesizedReport>(&body) {
            Ok(mut report) => {
                report.cache_id = Some(id.to_string());
                report.cached = true;
                // Another session may have re-run the same work since.
                if let Some(reader) = session {
                    report.session_id = Some(reader.to_string());
                }
                Ok(Some(report))
            }
            Err(e) => {
                debug!(error = %e, "cached entry is not a report");
                Ok(None)
            }
        }
    }

    /// One page of a stored report rendered as Markdown.
    pub fn report_page(
        &self,
        id: &str,
        session: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<Option<Page>, OrchestratorError> {
        Ok(self
            .stored_report(id, session)?
            .map(|report| paginate(&render_markdown(&report), offset, limit)))
    }
}
