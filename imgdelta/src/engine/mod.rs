//! Delta coordination.
//!
//! [`DeltaEngine::read_delta`] answers a request for the delta between two
//! versions of an artifact. Computed deltas and claims on deltas being
//! computed (leases) both live in the registry at a location derived from
//! the two digests, which is all replicas need to share. Leases expire, so a
//! crashed computation is retried by a later request; two requests racing on
//! an expired lease may both recompute, which is tolerated.

use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ociclient::{Credentials, ImageManifest, ImageReference};
use opentelemetry::metrics::Meter;
use tracing::{debug, error, info, instrument, warn};

use crate::compression::{self, ByteStream, CompressorKind};
use crate::config::DeltaConfig;
use crate::error::{AppError, Result};
use crate::registry::{DeltaPush, LeasePush, RegistryDelegate, RegistryError, Resolved};
use crate::selector::{self, AlgorithmChoice, DEFAULT_ACCEPTED};

mod lease;
mod location;
mod metrics;
mod tasks;

pub use self::lease::{DeltaState, Lease};
pub use self::location::DeltaLocation;
pub use self::metrics::EngineMetrics;
pub use self::tasks::{ActiveRequests, Claim, TaskGroup};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub repository_prefix: String,
    pub lease_duration: Duration,
    pub shutdown_timeout: Duration,
    pub require_auth: bool,
    /// Only store deltas on this registry host
    pub registry: Option<String>,
}

impl From<&DeltaConfig> for EngineConfig {
    fn from(config: &DeltaConfig) -> Self {
        Self {
            repository_prefix: config.repository_prefix.clone(),
            lease_duration: config.lease_duration(),
            shutdown_timeout: config.shutdown_timeout(),
            require_auth: config.require_auth,
            registry: config.registry.clone(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&crate::config::AppConfig::default().delta)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeltaRequest {
    pub from: String,
    pub to: String,
    /// Accepted differs and compressors; empty means the defaults
    pub accepted: Vec<String>,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeltaOutcome {
    Ready {
        target_image: ImageReference,
        delta_image: ImageReference,
    },
    /// The delta is being computed; ask again later
    InProgress,
    /// `from` and `to` are the same version
    NoNewVersion,
}

pub struct DeltaEngine {
    registry: Arc<dyn RegistryDelegate>,
    config: EngineConfig,
    active: ActiveRequests,
    tasks: Arc<TaskGroup>,
    metrics: Arc<EngineMetrics>,
}

/// Everything a background computation needs.
struct ComputeJob {
    registry: Arc<dyn RegistryDelegate>,
    metrics: Arc<EngineMetrics>,
    location: DeltaLocation,
    from: Resolved,
    to: Resolved,
    from_manifest: ImageManifest,
    to_manifest: ImageManifest,
    choice: AlgorithmChoice,
    credentials: Option<Credentials>,
}

fn parse_reference(name: &str, value: &str) -> Result<ImageReference> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(format!("missing {} parameter", name)));
    }
    value
        .parse()
        .map_err(|e| AppError::BadRequest(format!("invalid {} reference {}: {}", name, value, e)))
}

/// Map a registry failure; `not_found` builds the error for absent content.
fn registry_error(err: RegistryError, not_found: impl FnOnce(String) -> AppError) -> AppError {
    match err {
        RegistryError::Unauthorized(msg) => AppError::Unauthorized(msg),
        RegistryError::NotFound(msg) => not_found(msg),
        RegistryError::NotDigest(msg) => AppError::BadRequest(format!("{} is not a digest reference", msg)),
        other => AppError::Internal(other.to_string()),
    }
}

/// Manifests must agree on layer count and unpack semantics, and carry the
/// single content layer a delta is computed over.
fn check_compatible(from: &ImageManifest, to: &ImageManifest) -> Result<()> {
    let (from_layers, to_layers) = (from.content().len(), to.content().len());
    if from_layers != to_layers {
        return Err(AppError::IncompatibleArtifacts(format!(
            "from has {} layers, to has {}",
            from_layers, to_layers
        )));
    }
    if selector::is_unpacked(from) != selector::is_unpacked(to) {
        return Err(AppError::IncompatibleArtifacts("unpack flags differ".to_string()));
    }
    match from_layers {
        0 => Err(AppError::ArtifactNotFound("artifacts have no content".to_string())),
        1 => Ok(()),
        n => Err(AppError::IncompatibleArtifacts(format!(
            "artifacts have {} layers, deltas need exactly one",
            n
        ))),
    }
}

impl DeltaEngine {
    pub fn new(registry: Arc<dyn RegistryDelegate>, config: EngineConfig, meter: &Meter) -> Self {
        Self {
            registry,
            config,
            active: ActiveRequests::new(),
            tasks: TaskGroup::new(),
            metrics: Arc::new(EngineMetrics::new(meter)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn active_requests(&self) -> &ActiveRequests {
        &self.active
    }

    pub fn tasks(&self) -> &TaskGroup {
        &self.tasks
    }

    #[instrument(name = "read_delta", skip_all, fields(from = %request.from, to = %request.to))]
    pub async fn read_delta(&self, request: DeltaRequest) -> Result<DeltaOutcome> {
        let from = parse_reference("from", &request.from)?;
        let to = parse_reference("to", &request.to)?;

        if self.config.require_auth && request.credentials.is_none() {
            return Err(AppError::Unauthorized("credentials required".to_string()));
        }
        if !from.is_digest() {
            return Err(AppError::BadRequest(format!("from image {} must be pinned by digest", from)));
        }
        if !from.same_repository(&to) {
            return Err(AppError::BadRequest(format!(
                "{} and {} are not in the same repository",
                from, to
            )));
        }
        if let Some(registry) = &self.config.registry {
            if registry != &from.hostname {
                return Err(AppError::BadRequest(format!(
                    "deltas are stored on {}, images are on {}",
                    registry, from.hostname
                )));
            }
        }

        let credentials = request.credentials.as_ref();
        let from = self
            .registry
            .resolve(&from, true, credentials)
            .await
            .map_err(|e| registry_error(e, AppError::FailedToResolve))?;

        let to_is_alias = !to.is_digest();
        let to = self.registry.resolve(&to, false, credentials).await.map_err(|e| {
            registry_error(e, |msg| {
                if to_is_alias {
                    AppError::AliasNotFound(msg)
                } else {
                    AppError::FailedToResolve(msg)
                }
            })
        })?;

        if from.descriptor.digest == to.descriptor.digest {
            debug!("{} is already the latest version", from.reference);
            return Ok(DeltaOutcome::NoNewVersion);
        }

        let from_manifest = self
            .registry
            .load_manifest(&from.reference, credentials)
            .await
            .map_err(|e| registry_error(e, AppError::ArtifactNotFound))?;
        let to_manifest = self
            .registry
            .load_manifest(&to.reference, credentials)
            .await
            .map_err(|e| registry_error(e, AppError::ArtifactNotFound))?;
        check_compatible(&from_manifest, &to_manifest)?;

        let choice = if request.accepted.is_empty() {
            selector::select(&DEFAULT_ACCEPTED, &from_manifest, &to_manifest)
        } else {
            selector::select(&request.accepted, &from_manifest, &to_manifest)
        };

        let location = DeltaLocation::locate(
            &from.reference.hostname,
            &self.config.repository_prefix,
            &from.descriptor.digest,
            &to.descriptor.digest,
            &choice,
        );

        let Some(claim) = self.active.claim(location.key()) else {
            debug!("{} is already being handled by this process", location.key());
            return Ok(DeltaOutcome::InProgress);
        };

        match self.lookup(&location, credentials).await? {
            DeltaState::Ready(digest) => {
                return Ok(DeltaOutcome::Ready {
                    target_image: to.reference,
                    delta_image: location.reference.to_digest(digest),
                });
            }
            DeltaState::Leased(lease) if !lease.is_expired(Utc::now(), self.config.lease_duration) => {
                debug!("{} is leased since {}", location.key(), lease.created);
                return Ok(DeltaOutcome::InProgress);
            }
            DeltaState::Leased(lease) => {
                self.metrics.lease_expired.add(1, &EngineMetrics::algorithm_attributes(&choice));
                warn!("Lease on {} from {} expired, recomputing", location.key(), lease.created);
            }
            DeltaState::Absent => {}
        }

        let lease = LeasePush {
            from: from.reference.clone(),
            to: to.reference.clone(),
            choice,
            created: Utc::now(),
        };
        self.registry
            .push_dummy(&location.reference, lease, credentials)
            .await
            .map_err(|e| registry_error(e, AppError::DeltaNotFound))?;

        info!("Computing {} delta {} -> {}", choice, from.reference, to.reference);
        let job = ComputeJob {
            registry: Arc::clone(&self.registry),
            metrics: Arc::clone(&self.metrics),
            location,
            from,
            to,
            from_manifest,
            to_manifest,
            choice,
            credentials: request.credentials,
        };
        self.tasks.spawn(job.run(claim));

        Ok(DeltaOutcome::InProgress)
    }

    async fn lookup(&self, location: &DeltaLocation, credentials: Option<&Credentials>) -> Result<DeltaState> {
        let found = self
            .registry
            .fetch_manifest(&location.reference, credentials)
            .await
            .map_err(|e| registry_error(e, AppError::DeltaNotFound))?;

        Ok(DeltaState::classify(
            found.as_ref().map(|(descriptor, manifest)| (descriptor.digest.clone(), manifest)),
        ))
    }

    /// Wait until all background computations have finished.
    pub async fn wait_for_idle(&self) {
        self.tasks.wait_idle().await;
    }

    /// Wait for background computations up to the configured deadline.
    pub async fn shutdown(&self) -> bool {
        let outstanding = self.tasks.outstanding();
        if outstanding > 0 {
            info!("Waiting for {} delta computations", outstanding);
        }

        let finished = self.tasks.shutdown(self.config.shutdown_timeout).await;
        if !finished {
            warn!(
                "Abandoning {} delta computations, their leases will expire",
                self.tasks.outstanding()
            );
        }
        finished
    }
}

/// Open an artifact for diffing, decompressing it for differs that work on
/// plain archives.
fn open_input(file: std::fs::File, manifest: &ImageManifest, choice: &AlgorithmChoice) -> std::io::Result<ByteStream> {
    let stream: ByteStream = Box::new(BufReader::new(file));
    if !choice.differ.wants_plain_archives() {
        return Ok(stream);
    }

    let codec = manifest
        .content()
        .first()
        .map(|layer| CompressorKind::from_media_type(&layer.media_type))
        .unwrap_or(CompressorKind::Identity);
    codec.compressor().decompress(stream)
}

impl ComputeJob {
    async fn run(self, claim: Claim) {
        let started = Instant::now();
        let attributes = EngineMetrics::algorithm_attributes(&self.choice);
        let key = self.location.key();
        let metrics = Arc::clone(&self.metrics);

        match self.compute().await {
            Ok(delta) => {
                let elapsed = started.elapsed().as_secs_f64();
                metrics.compute_duration.record(elapsed, &attributes);
                info!("Delta {} ready after {:.1}s", delta.reference, elapsed);
            }
            Err(e) => {
                metrics.compute_failures.add(1, &attributes);
                error!("Computing delta {} failed: {:#}", key, e);
            }
        }

        drop(claim);
    }

    async fn compute(self) -> anyhow::Result<Resolved> {
        let credentials = self.credentials.as_ref();
        let old = self
            .registry
            .load_artifact(&self.from.reference, &self.from_manifest, credentials)
            .await?;
        let new = self
            .registry
            .load_artifact(&self.to.reference, &self.to_manifest, credentials)
            .await?;

        let choice = self.choice;
        let (from_manifest, to_manifest) = (self.from_manifest, self.to_manifest);
        let content = tokio::task::spawn_blocking(move || -> anyhow::Result<ByteStream> {
            let old = open_input(old, &from_manifest, &choice)?;
            let new = open_input(new, &to_manifest, &choice)?;
            let patch = choice.differ_impl().diff(old, new)?;
            Ok(choice.compressor_impl().compress(patch)?)
        })
        .await??;

        let push = DeltaPush {
            from: self.from.reference.clone(),
            to: self.to.reference.clone(),
            choice,
        };
        let delta = self
            .registry
            .push_delta(&self.location.reference, push, content, credentials)
            .await?;
        Ok(delta)
    }
}

/// Open a local input for `choice`; archives for archive differs may be
/// gzip or zstd compressed.
fn open_local<R: BufRead + Send + 'static>(input: R, choice: &AlgorithmChoice) -> std::io::Result<ByteStream> {
    if choice.differ.wants_plain_archives() {
        compression::decompress_detected(input)
    } else {
        Ok(Box::new(input))
    }
}

/// Compute a delta between two local artifacts.
pub fn compute_delta<O, N>(choice: AlgorithmChoice, old: O, new: N) -> Result<ByteStream>
where
    O: BufRead + Send + 'static,
    N: BufRead + Send + 'static,
{
    let patch = choice.differ_impl().diff(open_local(old, &choice)?, open_local(new, &choice)?)?;
    Ok(choice.compressor_impl().compress(patch)?)
}

/// Rebuild the new version of an artifact from the old version and a delta
/// stored under `tag`. Archive deltas rebuild the uncompressed archive.
pub fn apply_delta<O>(tag: &str, old: O, delta: impl Read + Send + 'static) -> Result<ByteStream>
where
    O: BufRead + Send + 'static,
{
    let choice = AlgorithmChoice::from_tag(tag)
        .ok_or_else(|| AppError::NotYetImplemented(format!("unknown delta algorithm {}", tag)))?;
    let patch = choice.compressor_impl().decompress(Box::new(delta))?;
    Ok(choice.patcher_impl().patch(open_local(old, &choice)?, patch)?)
}
