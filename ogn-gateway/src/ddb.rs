//! Device database with periodic refresh.
//!
//! The current [`DdbSnapshot`] sits behind an `Arc` that a refresh swaps in
//! one step, so readers never observe a half-loaded table. Enrichment runs on
//! the beacon hot path and only checks the refresh clock; downloads happen in
//! spawned tasks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use ogn_core::config::DdbConfig;
use ogn_core::{Aircraft, DdbSnapshot, Enrich, OgnError};

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
/// Upper bound for a whole fetch, whatever the source.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid device database: {0}")]
    Parse(#[from] OgnError),

    #[error("no cache file configured")]
    NoCache,

    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

/// Unparsed device database payload.
#[derive(Debug, Clone)]
pub struct RawDdb {
    pub devices: String,
    pub icao: Option<String>,
}

/// Where device database payloads come from.
#[async_trait]
pub trait DdbSource: Send + Sync {
    async fn fetch(&self) -> Result<RawDdb, FetchError>;

    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Downloads the DDB over HTTPS. The ICAO table may come from a URL or a
/// local file.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    icao_url: Option<String>,
    icao_path: Option<PathBuf>,
}

impl HttpSource {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "unable to configure HTTP client, using defaults");
                reqwest::Client::new()
            });
        HttpSource {
            client,
            url: url.to_string(),
            icao_url: None,
            icao_path: None,
        }
    }

    pub fn with_icao_url(mut self, url: &str) -> Self {
        self.icao_url = Some(url.to_string());
        self
    }

    pub fn with_icao_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.icao_path = Some(path.into());
        self
    }

    async fn get(&self, url: &str) -> Result<String, FetchError> {
        let text = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(text)
    }
}

#[async_trait]
impl DdbSource for HttpSource {
    async fn fetch(&self) -> Result<RawDdb, FetchError> {
        let devices = self.get(&self.url).await?;
        let icao = match (&self.icao_url, &self.icao_path) {
            (Some(url), _) => Some(self.get(url).await?),
            (None, Some(path)) => Some(tokio::fs::read_to_string(path).await?),
            (None, None) => None,
        };
        Ok(RawDdb { devices, icao })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Reads the DDB from local files.
pub struct FileSource {
    devices: PathBuf,
    icao: Option<PathBuf>,
}

impl FileSource {
    pub fn new(devices: impl Into<PathBuf>, icao: Option<PathBuf>) -> Self {
        FileSource {
            devices: devices.into(),
            icao,
        }
    }
}

#[async_trait]
impl DdbSource for FileSource {
    async fn fetch(&self) -> Result<RawDdb, FetchError> {
        let devices = tokio::fs::read_to_string(&self.devices).await?;
        let icao = match &self.icao {
            Some(path) => Some(tokio::fs::read_to_string(path).await?),
            None => None,
        };
        Ok(RawDdb { devices, icao })
    }

    fn describe(&self) -> String {
        self.devices.display().to_string()
    }
}

// ---------------------------------------------------------------------------
// DeviceDatabase
// ---------------------------------------------------------------------------

struct Inner {
    snapshot: RwLock<Arc<DdbSnapshot>>,
    source: Box<dyn DdbSource>,
    cache_path: Option<PathBuf>,
    refresh_interval: Duration,
    fetch_timeout: Duration,
    last_attempt: Mutex<Option<Instant>>,
    refreshing: AtomicBool,
    warned_empty: AtomicBool,
}

/// Shared handle to the refreshing device database. Cloning is cheap.
#[derive(Clone)]
pub struct DeviceDatabase {
    inner: Arc<Inner>,
}

impl DeviceDatabase {
    pub fn new(source: impl DdbSource + 'static, refresh_interval: Duration) -> Self {
        DeviceDatabase {
            inner: Arc::new(Inner {
                snapshot: RwLock::new(Arc::new(DdbSnapshot::default())),
                source: Box::new(source),
                cache_path: None,
                refresh_interval,
                fetch_timeout: FETCH_TIMEOUT,
                last_attempt: Mutex::new(None),
                refreshing: AtomicBool::new(false),
                warned_empty: AtomicBool::new(false),
            }),
        }
    }

    /// Persist successful downloads to `path` and fall back to it at startup.
    ///
    /// Must be called before the handle is cloned.
    pub fn with_cache(mut self, path: impl Into<PathBuf>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.cache_path = Some(path.into());
        }
        self
    }

    /// Give up on a fetch after `limit`. Must be called before the handle is
    /// cloned.
    pub fn with_fetch_timeout(mut self, limit: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.fetch_timeout = limit;
        }
        self
    }

    /// Build from the `ddb:` config section. `None` when disabled.
    pub fn from_config(config: &DdbConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let mut source = HttpSource::new(&config.url);
        if let Some(url) = &config.icao_url {
            source = source.with_icao_url(url);
        } else if let Some(path) = &config.icao_path {
            source = source.with_icao_path(path);
        }
        let mut db = DeviceDatabase::new(source, config.refresh_interval());
        if let Some(path) = &config.cache_path {
            db = db.with_cache(path);
        }
        Some(db)
    }

    /// Current snapshot. Cheap; the returned `Arc` stays valid across refreshes.
    pub fn snapshot(&self) -> Arc<DdbSnapshot> {
        let guard = self.inner.snapshot.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn install(&self, snapshot: DdbSnapshot) {
        let mut guard = self.inner.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
        self.inner.warned_empty.store(false, Ordering::Relaxed);
    }

    fn mark_attempt(&self) {
        let mut last = self.inner.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        *last = Some(Instant::now());
    }

    /// Whether the refresh interval has elapsed since the last attempt.
    pub fn refresh_due(&self) -> bool {
        let last = self.inner.last_attempt.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) => at.elapsed() >= self.inner.refresh_interval,
            None => true,
        }
    }

    /// Fetch and swap in a new snapshot. On failure the previous snapshot
    /// stays in place. Returns the number of devices loaded.
    pub async fn refresh(&self) -> Result<usize, FetchError> {
        self.mark_attempt();
        let limit = self.inner.fetch_timeout;
        let raw = tokio::time::timeout(limit, self.inner.source.fetch())
            .await
            .map_err(|_| FetchError::Timeout(limit))??;
        let snapshot = DdbSnapshot::from_json(&raw.devices, raw.icao.as_deref())?;
        let count = snapshot.len();
        self.install(snapshot);
        info!(devices = count, source = %self.inner.source.describe(), "device database loaded");

        if let Some(path) = &self.inner.cache_path {
            if let Err(e) = write_cache(path, &raw).await {
                warn!(path = %path.display(), error = %e, "unable to write device database cache");
            }
        }
        Ok(count)
    }

    /// Initial load: download, falling back to the cache file.
    pub async fn load(&self) -> Result<usize, FetchError> {
        match self.refresh().await {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!(error = %e, "device database download failed, trying cache");
                match self.load_cache().await {
                    Ok(count) => Ok(count),
                    Err(FetchError::NoCache) => Err(e),
                    Err(cache_err) => {
                        warn!(error = %cache_err, "device database cache unusable");
                        Err(e)
                    }
                }
            }
        }
    }

    pub async fn load_cache(&self) -> Result<usize, FetchError> {
        let path = self.inner.cache_path.as_ref().ok_or(FetchError::NoCache)?;
        let raw = read_cache(path).await?;
        let snapshot = DdbSnapshot::from_json(&raw.devices, raw.icao.as_deref())?;
        let count = snapshot.len();
        self.install(snapshot);
        info!(devices = count, path = %path.display(), "device database loaded from cache");
        Ok(count)
    }

    /// Start a background refresh when one is due and none is running.
    /// Does nothing outside a tokio runtime.
    pub fn maybe_refresh(&self) {
        if !self.refresh_due() || self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.refreshing.store(false, Ordering::Release);
            return;
        };
        self.mark_attempt();
        let db = self.clone();
        handle.spawn(async move {
            debug!("refreshing device database");
            if let Err(e) = db.refresh().await {
                warn!(error = %e, "device database refresh failed, keeping previous data");
            }
            db.inner.refreshing.store(false, Ordering::Release);
        });
    }
}

impl Enrich for DeviceDatabase {
    fn enrich(&self, aircraft: &mut Aircraft) {
        self.maybe_refresh();
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            if !self.inner.warned_empty.swap(true, Ordering::Relaxed) {
                warn!("device database not loaded, aircraft are not enriched");
            }
            return;
        }
        snapshot.enrich(aircraft);
    }
}

fn icao_cache_path(path: &Path) -> PathBuf {
    path.with_extension("icao.json")
}

async fn write_cache(path: &Path, raw: &RawDdb) -> Result<(), FetchError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    tokio::fs::write(path, &raw.devices).await?;
    if let Some(icao) = &raw.icao {
        tokio::fs::write(icao_cache_path(path), icao).await?;
    }
    Ok(())
}

async fn read_cache(path: &Path) -> Result<RawDdb, FetchError> {
    let devices = tokio::fs::read_to_string(path).await?;
    let icao = tokio::fs::read_to_string(icao_cache_path(path)).await.ok();
    Ok(RawDdb { devices, icao })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    const DEVICES: &str = r#"{"devices":[
        {"device_type":"F","device_id":"DDEEFF","registration":"D-KABC","cn":"BC","tracked":"Y","identified":"Y"},
        {"device_type":"F","device_id":"DD1234","registration":"D-5678","cn":"","tracked":"N","identified":"Y"}
    ]}"#;

    const DEVICES_V2: &str = r#"{"devices":[
        {"device_type":"F","device_id":"DDEEFF","registration":"D-KXYZ","cn":"XY","tracked":"Y","identified":"Y"}
    ]}"#;

    /// Serves queued payloads in order, then fails.
    struct Scripted {
        payloads: Mutex<Vec<Result<RawDdb, ()>>>,
        calls: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new(payloads: Vec<Result<&str, ()>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let mut queued: Vec<Result<RawDdb, ()>> = payloads
                .into_iter()
                .map(|p| {
                    p.map(|d| RawDdb {
                        devices: d.to_string(),
                        icao: None,
                    })
                })
                .collect();
            queued.reverse();
            (
                Scripted {
                    payloads: Mutex::new(queued),
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl DdbSource for Scripted {
        async fn fetch(&self) -> Result<RawDdb, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.payloads.lock().unwrap().pop() {
                Some(Ok(raw)) => Ok(raw),
                _ => Err(FetchError::Io(std::io::Error::other("unreachable"))),
            }
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    /// Never answers.
    struct Stalled(Arc<AtomicUsize>);

    #[async_trait]
    impl DdbSource for Stalled {
        async fn fetch(&self) -> Result<RawDdb, FetchError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        fn describe(&self) -> String {
            "stalled".into()
        }
    }

    fn registration(db: &DeviceDatabase, device_id: &str) -> Option<String> {
        let mut ac = Aircraft::new(device_id, Utc::now());
        db.snapshot().enrich(&mut ac);
        ac.registration
    }

    #[tokio::test]
    async fn test_refresh_swaps_snapshot() {
        let (source, _) = Scripted::new(vec![Ok(DEVICES), Ok(DEVICES_V2)]);
        let db = DeviceDatabase::new(source, Duration::from_secs(3600));

        assert_eq!(db.refresh().await.unwrap(), 2);
        let before = db.snapshot();
        assert_eq!(registration(&db, "FLRDDEEFF").as_deref(), Some("D-KABC"));

        assert_eq!(db.refresh().await.unwrap(), 1);
        assert_eq!(registration(&db, "FLRDDEEFF").as_deref(), Some("D-KXYZ"));
        // Holders of the old snapshot keep a consistent view
        assert_eq!(before.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous() {
        let (source, _) = Scripted::new(vec![Ok(DEVICES), Err(())]);
        let db = DeviceDatabase::new(source, Duration::from_secs(3600));
        db.refresh().await.unwrap();

        assert!(db.refresh().await.is_err());
        assert_eq!(db.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_download_is_rejected() {
        let (source, _) = Scripted::new(vec![Ok(DEVICES), Ok(r#"{"devices":[]}"#)]);
        let db = DeviceDatabase::new(source, Duration::from_secs(3600));
        db.refresh().await.unwrap();

        assert!(matches!(db.refresh().await, Err(FetchError::Parse(_))));
        assert_eq!(db.len(), 2);
    }

    #[tokio::test]
    async fn test_cache_written_and_used_as_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("nested").join("ddb.json");

        let (source, _) = Scripted::new(vec![Ok(DEVICES)]);
        let db = DeviceDatabase::new(source, Duration::from_secs(3600)).with_cache(&cache);
        db.load().await.unwrap();
        assert!(cache.exists());

        let (offline, _) = Scripted::new(vec![Err(())]);
        let db = DeviceDatabase::new(offline, Duration::from_secs(3600)).with_cache(&cache);
        assert_eq!(db.load().await.unwrap(), 2);
        assert_eq!(registration(&db, "FLRDDEEFF").as_deref(), Some("D-KABC"));
    }

    #[tokio::test]
    async fn test_load_without_cache_reports_download_error() {
        let (offline, _) = Scripted::new(vec![Err(())]);
        let db = DeviceDatabase::new(offline, Duration::from_secs(3600));
        assert!(matches!(db.load().await, Err(FetchError::Io(_))));
        assert!(db.is_empty());
    }

    #[tokio::test]
    async fn test_file_source_with_icao_table() {
        let dir = tempfile::tempdir().unwrap();
        let devices = dir.path().join("ddb.json");
        let icao = dir.path().join("icao.json");
        std::fs::write(&devices, DEVICES).unwrap();
        std::fs::write(&icao, r#"{"D-KABC":{"icao":"3DD4F1"}}"#).unwrap();

        let db = DeviceDatabase::new(FileSource::new(&devices, Some(icao)), Duration::from_secs(3600));
        db.refresh().await.unwrap();

        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        db.enrich(&mut ac);
        assert_eq!(ac.icao_hex().as_deref(), Some("3DD4F1"));
    }

    #[tokio::test]
    async fn test_enrich_on_empty_database_is_noop() {
        let (offline, _) = Scripted::new(vec![]);
        let db = DeviceDatabase::new(offline, Duration::from_secs(3600));
        db.mark_attempt();

        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        db.enrich(&mut ac);
        assert!(ac.registration.is_none());
        assert!(ac.tracking_allowed);
    }

    #[tokio::test]
    async fn test_enrich_triggers_background_refresh() {
        let (source, calls) = Scripted::new(vec![Ok(DEVICES)]);
        let db = DeviceDatabase::new(source, Duration::from_secs(3600));
        assert!(db.refresh_due());

        let mut ac = Aircraft::new("FLRDDEEFF", Utc::now());
        db.enrich(&mut ac);
        assert!(!db.refresh_due());

        tokio::time::timeout(Duration::from_secs(5), async {
            while db.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("background refresh should complete");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Not due again within the interval
        let mut other = Aircraft::new("FLRDD1234", Utc::now());
        db.enrich(&mut other);
        assert!(!other.tracking_allowed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stalled_download_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("ddb.json");
        let (source, _) = Scripted::new(vec![Ok(DEVICES)]);
        DeviceDatabase::new(source, Duration::from_secs(3600))
            .with_cache(&cache)
            .load()
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let db = DeviceDatabase::new(Stalled(Arc::clone(&calls)), Duration::from_secs(3600))
            .with_fetch_timeout(Duration::from_millis(50))
            .with_cache(&cache);
        let count = tokio::time::timeout(Duration::from_secs(5), db.load())
            .await
            .expect("load must not hang on a stalled source")
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stalled_background_refresh_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let db = DeviceDatabase::new(Stalled(Arc::clone(&calls)), Duration::ZERO)
            .with_fetch_timeout(Duration::from_millis(20));
        assert!(matches!(db.refresh().await, Err(FetchError::Timeout(_))));

        db.maybe_refresh();
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 2 || db.inner.refreshing.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out refresh must release the in-progress flag");

        db.maybe_refresh();
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("a later refresh should start");
    }

    #[test]
    fn test_no_refresh_outside_runtime() {
        let (source, calls) = Scripted::new(vec![Ok(DEVICES)]);
        let db = DeviceDatabase::new(source, Duration::ZERO);
        db.maybe_refresh();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(db.refresh_due());
    }

    #[test]
    fn test_from_config() {
        let mut config = ogn_core::config::Config::default().ddb;
        config.enabled = false;
        assert!(DeviceDatabase::from_config(&config).is_none());

        config.enabled = true;
        config.cache_path = Some("/tmp/ddb.json".into());
        let db = DeviceDatabase::from_config(&config).unwrap();
        assert_eq!(db.inner.cache_path.as_deref(), Some(Path::new("/tmp/ddb.json")));
        assert_eq!(db.inner.refresh_interval, Duration::from_secs(24 * 3600));
        assert_eq!(db.inner.fetch_timeout, FETCH_TIMEOUT);

        config.refresh_hours = f64::INFINITY;
        let db = DeviceDatabase::from_config(&config).unwrap();
        assert_eq!(db.inner.refresh_interval, Duration::from_secs(24 * 3600));
    }
}
