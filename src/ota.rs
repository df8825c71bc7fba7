use crate::crypto;
use crate::error::{HttpError, OtaError, OtaResult};
use crate::http_client::{HttpClient, HttpRequest};
use crate::kv::KvStore;
use crate::mqtt_session::{IotChannel, MessageHandler, Qos};
use crate::thing_model::{envelope, message_id};
use crate::topic::{segment, TopicSpace};
use crate::types::{unix_timestamp_ms, DeviceIdentity, OtaConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Device-side status reported on the progress topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpgradeDeviceStatus {
    ToUpgrade,
    Downloading,
    Downloaded,
    DiffRecovering,
    DiffRecovered,
    Installing,
    Installed,
    Success,
    Failed,
}

impl UpgradeDeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradeDeviceStatus::ToUpgrade => "ToUpgrade",
            UpgradeDeviceStatus::Downloading => "Downloading",
            UpgradeDeviceStatus::Downloaded => "Downloaded",
            UpgradeDeviceStatus::DiffRecovering => "DiffRecovering",
            UpgradeDeviceStatus::DiffRecovered => "DiffRecovered",
            UpgradeDeviceStatus::Installing => "Installing",
            UpgradeDeviceStatus::Installed => "Installed",
            UpgradeDeviceStatus::Success => "Success",
            UpgradeDeviceStatus::Failed => "Failed",
        }
    }
}

/// One OTA job as announced by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaJobInfo {
    #[serde(rename = "ota_job_id")]
    pub job_id: String,
    pub module: String,
    pub dest_version: String,
    /// AES-encrypted download URL as delivered.
    #[serde(default)]
    pub url: String,
    #[serde(rename = "timeout_in_minutes", default)]
    pub timeout_minutes: i64,
    #[serde(default)]
    pub size: u64,
    /// Expected MD5 of the package, lowercase hex.
    #[serde(default)]
    pub sign: Option<String>,
}

/// Persisted snapshot of a download task, keyed by job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OtaTaskSnapshot {
    ota_file_path: String,
    decode_url: String,
    retry_time: i32,
    upgrade_device_status: String,
}

/// In-memory task state for one job.
#[derive(Debug, Clone)]
struct OtaTask {
    job: OtaJobInfo,
    decoded_url: String,
    file_path: PathBuf,
    retry_count: i32,
    is_pending_retry: bool,
    status: UpgradeDeviceStatus,
}

pub type JobInfoCallback = Arc<dyn Fn(&OtaJobInfo) + Send + Sync>;
pub type DataProgressCallback = Arc<dyn Fn(&OtaJobInfo, &[u8], u32) + Send + Sync>;
/// `(result_code, job, downloaded file)`; code 0 means success.
pub type DownloadCompleteCallback = Arc<dyn Fn(i32, &OtaJobInfo, Option<&Path>) + Send + Sync>;

fn job_info_key(module: &str) -> String {
    format!("key_save_job_info_{module}")
}

fn task_info_key(job_id: &str) -> String {
    format!("key_save_task_info_{job_id}")
}

struct OtaInner {
    channel: Arc<dyn IotChannel>,
    http: HttpClient,
    topics: TopicSpace,
    kv: KvStore,
    download_dir: PathBuf,
    device_secret: String,
    ca_pem: Option<String>,
    modules: Mutex<Vec<(String, String)>>,
    tasks: Mutex<HashMap<String, OtaTask>>,
    on_job_info: Mutex<Option<JobInfoCallback>>,
    on_progress: Mutex<Option<DataProgressCallback>>,
    on_complete: Mutex<Option<DownloadCompleteCallback>>,
}

/// OTA orchestrator: notify → job detail → decrypt → download → verify
/// → report, with persistence across restarts.
pub struct OtaManager {
    inner: Arc<OtaInner>,
}

impl OtaManager {
    /// Wire the orchestrator onto the channel: subscribes the notify and
    /// upgrade-reply topics.
    pub fn attach(
        channel: Arc<dyn IotChannel>,
        identity: &DeviceIdentity,
        config: &OtaConfig,
        ca_pem: Option<String>,
    ) -> OtaResult<Self> {
        let device_secret = identity
            .device_secret()
            .ok_or_else(|| OtaError::InvalidArgument("device_secret missing".to_string()))?
            .to_string();
        let kv = KvStore::open(&config.state_dir)
            .map_err(|e| OtaError::Persistence(e.to_string()))?;
        let inner = Arc::new(OtaInner {
            channel: Arc::clone(&channel),
            http: HttpClient::new(),
            topics: TopicSpace::new(&identity.product_key, &identity.device_name),
            kv,
            download_dir: config.download_dir.clone(),
            device_secret,
            ca_pem,
            modules: Mutex::new(Vec::new()),
            tasks: Mutex::new(HashMap::new()),
            on_job_info: Mutex::new(None),
            on_progress: Mutex::new(None),
            on_complete: Mutex::new(None),
        });

        let notify_inner = Arc::clone(&inner);
        let notify: MessageHandler = Arc::new(move |topic: &str, payload: &[u8]| {
            notify_inner.on_notify(topic, payload);
        });
        channel.subscribe(&inner.topics.ota_notify_filter(), Qos::AtLeastOnce, notify)?;

        let reply_inner = Arc::clone(&inner);
        let reply: MessageHandler = Arc::new(move |_topic: &str, payload: &[u8]| {
            reply_inner.on_upgrade_reply(payload);
        });
        channel.subscribe(
            &inner.topics.ota_upgrade_post_reply(),
            Qos::AtLeastOnce,
            reply,
        )?;

        Ok(Self { inner })
    }

    pub fn set_job_info_callback(&self, callback: JobInfoCallback) {
        *self.inner.on_job_info.lock().unwrap() = Some(callback);
    }

    pub fn set_data_progress_callback(&self, callback: DataProgressCallback) {
        *self.inner.on_progress.lock().unwrap() = Some(callback);
    }

    pub fn set_download_complete_callback(&self, callback: DownloadCompleteCallback) {
        *self.inner.on_complete.lock().unwrap() = Some(callback);
    }

    /// Register the installed `(module, version)` pairs, reconcile
    /// persisted jobs against them and publish the version report.
    pub fn set_modules(&self, modules: &[(String, String)]) -> OtaResult<()> {
        *self.inner.modules.lock().unwrap() = modules.to_vec();

        for (module, version) in modules {
            let Some(raw) = self.inner.kv.get(&job_info_key(module)) else {
                continue;
            };
            let Ok(job) = serde_json::from_str::<OtaJobInfo>(&raw) else {
                warn!(%module, "dropping unparseable persisted job info");
                let _ = self.inner.kv.remove(&job_info_key(module));
                continue;
            };
            if &job.dest_version == version {
                // The previous upgrade landed: report and forget it.
                info!(job_id = %job.job_id, %version, "upgrade verified installed");
                self.inner
                    .report_progress(&job.job_id, UpgradeDeviceStatus::Success, 0, "");
                let _ = self.inner.kv.remove(&job_info_key(module));
                let _ = self.inner.kv.remove(&task_info_key(&job.job_id));
            } else if let Some(task_raw) = self.inner.kv.get(&task_info_key(&job.job_id)) {
                if let Ok(snapshot) = serde_json::from_str::<OtaTaskSnapshot>(&task_raw) {
                    debug!(job_id = %job.job_id, "rehydrating persisted download task");
                    self.inner.tasks.lock().unwrap().insert(
                        job.job_id.clone(),
                        OtaTask {
                            job: job.clone(),
                            decoded_url: snapshot.decode_url,
                            file_path: PathBuf::from(snapshot.ota_file_path),
                            retry_count: snapshot.retry_time,
                            is_pending_retry: true,
                            status: UpgradeDeviceStatus::Downloaded,
                        },
                    );
                }
            }
        }

        self.inner.report_version();
        Ok(())
    }

    /// Request job detail for every registered module (e.g. at startup,
    /// without waiting for a notify).
    pub fn request_job_info(&self) -> OtaResult<()> {
        let modules = self.inner.modules.lock().unwrap().clone();
        for (module, version) in modules {
            self.inner.publish_upgrade_request(&module, &version, None);
        }
        Ok(())
    }

    /// Download and verify the package for `job`. Returns the verified
    /// file path.
    pub async fn start_download(&self, job: OtaJobInfo) -> OtaResult<PathBuf> {
        let inner = &self.inner;

        // A finished task whose file still verifies short-circuits.
        let existing = inner.tasks.lock().unwrap().get(&job.job_id).cloned();
        if let Some(task) = existing {
            if let Some(sign) = job.sign.as_deref().filter(|s| !s.is_empty()) {
                if task.file_path.exists() {
                    if let Ok(actual) = crypto::md5_file_hex(&task.file_path) {
                        if actual.eq_ignore_ascii_case(sign) {
                            info!(job_id = %job.job_id, "package already downloaded and verified");
                            inner.report_progress(
                                &job.job_id,
                                UpgradeDeviceStatus::Downloaded,
                                0,
                                "",
                            );
                            inner.complete(0, &job, Some(&task.file_path));
                            return Ok(task.file_path);
                        }
                    }
                }
            }
            if !task.is_pending_retry {
                return Err(OtaError::InvalidArgument(format!(
                    "job {} already downloading",
                    job.job_id
                )));
            }
        }

        if job.url.is_empty() || job.size == 0 {
            return Err(OtaError::InvalidArgument(
                "job carries no download url or size".to_string(),
            ));
        }

        // AES-CBC-128, key and IV both from the device secret.
        let decoded_url = crypto::aes_decode_string(&inner.device_secret, &job.url, true)
            .map_err(|e| OtaError::Decrypt(e.to_string()))?;
        let file_name = extract_filename(&decoded_url)
            .ok_or_else(|| OtaError::Decrypt("decrypted url has no file name".to_string()))?;
        let file_path = inner.download_dir.join(file_name);
        debug!(job_id = %job.job_id, path = %file_path.display(), "starting package download");

        let retry_count = existing_retry_count(inner, &job.job_id);
        inner.tasks.lock().unwrap().insert(
            job.job_id.clone(),
            OtaTask {
                job: job.clone(),
                decoded_url: decoded_url.clone(),
                file_path: file_path.clone(),
                retry_count,
                is_pending_retry: false,
                status: UpgradeDeviceStatus::Downloading,
            },
        );

        let mut req = HttpRequest::get(&decoded_url).timeouts(10_000, 10 * 60 * 1000);
        req.ca_pem = inner.ca_pem.clone();

        let progress_job = job.clone();
        let progress_inner = Arc::clone(inner);
        let total_size = job.size;
        let result = inner
            .http
            .download(
                &req,
                &file_path,
                Some(job.size),
                job.sign.as_deref(),
                move |chunk, downloaded, _total| {
                    let percent = if total_size > 0 {
                        ((100 * downloaded) / total_size).min(100) as u32
                    } else {
                        0
                    };
                    if let Some(cb) = progress_inner.on_progress.lock().unwrap().as_ref() {
                        cb(&progress_job, chunk, percent);
                    }
                },
            )
            .await;

        match result {
            Ok(_) => {
                info!(job_id = %job.job_id, "package downloaded and verified");
                inner.report_progress(&job.job_id, UpgradeDeviceStatus::Downloaded, 0, "");
                inner.persist_task(&job, &decoded_url, &file_path, retry_count);
                inner.complete(0, &job, Some(&file_path));
                inner.tasks.lock().unwrap().remove(&job.job_id);
                Ok(file_path)
            }
            Err(e) => {
                // The engine already deleted the partial file. Keep the
                // verification failures distinguishable in the reported
                // result code.
                let err = match e {
                    HttpError::SizeMismatch { expected, actual } => {
                        OtaError::SizeMismatch { expected, actual }
                    }
                    HttpError::SignatureMismatch { expected, actual } => {
                        OtaError::SignatureMismatch { expected, actual }
                    }
                    other => OtaError::Http(other),
                };
                inner.report_progress(
                    &job.job_id,
                    UpgradeDeviceStatus::Failed,
                    err.result_code(),
                    "download failed",
                );
                inner.complete(err.result_code(), &job, None);
                inner.tasks.lock().unwrap().remove(&job.job_id);
                let _ = inner.kv.remove(&task_info_key(&job.job_id));
                Err(err)
            }
        }
    }

    /// Report the install phase of a job.
    pub fn report_installing(&self, job_id: &str) {
        self.inner
            .report_progress(job_id, UpgradeDeviceStatus::Installing, 0, "");
    }

    pub fn report_installed(&self, job_id: &str) {
        self.inner
            .report_progress(job_id, UpgradeDeviceStatus::Installed, 0, "");
    }

    pub fn report_install_success(&self, job_id: &str) {
        self.inner
            .report_progress(job_id, UpgradeDeviceStatus::Success, 0, "");
    }

    /// Report a failed install; the task becomes eligible for retry.
    pub fn report_install_failed(&self, job_id: &str, desc: &str) {
        if let Some(task) = self.inner.tasks.lock().unwrap().get_mut(job_id) {
            task.is_pending_retry = true;
        }
        let code = OtaError::InstallFailed(desc.to_string()).result_code();
        self.inner
            .report_progress(job_id, UpgradeDeviceStatus::Failed, code, desc);
    }
}

fn existing_retry_count(inner: &OtaInner, job_id: &str) -> i32 {
    inner
        .tasks
        .lock()
        .unwrap()
        .get(job_id)
        .map(|t| t.retry_count + 1)
        .unwrap_or(0)
}

impl OtaInner {
    /// Inbound `ota/notify/<job_id>`: an Upgrade notice for a known
    /// module triggers the upgrade-detail request.
    fn on_notify(&self, topic: &str, payload: &[u8]) {
        let job_id = segment(topic, 5).unwrap_or_default().to_string();
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            warn!("unparseable ota notify payload");
            return;
        };
        let Some(data) = value.get("data") else { return };
        let kind = data.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "Upgrade" {
            debug!(%kind, "ignoring non-upgrade ota notify");
            return;
        }
        let module = data.get("module").and_then(Value::as_str).unwrap_or_default();
        let modules = self.modules.lock().unwrap().clone();
        for (known, version) in modules {
            if known == module {
                info!(%module, %job_id, "upgrade notice received");
                self.publish_upgrade_request(&known, &version, Some(&job_id));
            }
        }
    }

    /// Inbound `ota/upgrade/post_reply`: carries the full job info.
    fn on_upgrade_reply(&self, payload: &[u8]) {
        let Ok(value) = serde_json::from_slice::<Value>(payload) else {
            warn!("unparseable ota upgrade reply");
            return;
        };
        let Some(data) = value.get("data") else { return };
        let Ok(job) = serde_json::from_value::<OtaJobInfo>(data.clone()) else {
            warn!("ota upgrade reply carries no job info");
            return;
        };
        if job.url.is_empty() || job.size == 0 {
            debug!(job_id = %job.job_id, "upgrade reply without url, ignoring");
            return;
        }
        if let Err(e) = self.kv.put(&job_info_key(&job.module), &data.to_string()) {
            warn!("persisting job info failed: {e}");
        }
        if let Some(cb) = self.on_job_info.lock().unwrap().as_ref() {
            cb(&job);
        }
    }

    fn publish_upgrade_request(&self, module: &str, version: &str, job_id: Option<&str>) {
        let mut params = json!({
            "module": module,
            "src_version": version,
        });
        if let Some(job_id) = job_id {
            params["ota_job_id"] = json!(job_id);
        }
        let payload = envelope(&message_id(), params).to_string();
        if let Err(e) = self.channel.publish(
            &self.topics.ota_upgrade_post(),
            payload.as_bytes(),
            Qos::AtLeastOnce,
        ) {
            warn!("upgrade request publish failed: {e}");
        }
    }

    /// Version report on `ota/version`: `{module: version, ...}`.
    fn report_version(&self) {
        let mut params = serde_json::Map::new();
        for (module, version) in self.modules.lock().unwrap().iter() {
            params.insert(module.clone(), json!(version));
        }
        let payload = envelope(&message_id(), Value::Object(params)).to_string();
        if let Err(e) = self.channel.publish(
            &self.topics.ota_version(),
            payload.as_bytes(),
            Qos::AtLeastOnce,
        ) {
            warn!("version report publish failed: {e}");
        }
    }

    fn report_progress(&self, job_id: &str, status: UpgradeDeviceStatus, code: i32, desc: &str) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(job_id) {
            task.status = status;
        }
        let params = json!({
            "status": status.as_str(),
            "result_code": code,
            "result_desc": desc,
            "time": unix_timestamp_ms(),
        });
        let payload = envelope(&message_id(), params).to_string();
        if let Err(e) = self.channel.publish(
            &self.topics.ota_progress(job_id),
            payload.as_bytes(),
            Qos::AtLeastOnce,
        ) {
            warn!("progress report publish failed: {e}");
        }
    }

    fn persist_task(&self, job: &OtaJobInfo, decoded_url: &str, path: &Path, retry_count: i32) {
        let snapshot = OtaTaskSnapshot {
            ota_file_path: path.display().to_string(),
            decode_url: decoded_url.to_string(),
            retry_time: retry_count,
            upgrade_device_status: UpgradeDeviceStatus::Downloaded.as_str().to_string(),
        };
        let raw = serde_json::to_string(&snapshot).expect("snapshot serialises");
        if let Err(e) = self.kv.put(&task_info_key(&job.job_id), &raw) {
            warn!("persisting task info failed: {e}");
        }
    }

    fn complete(&self, code: i32, job: &OtaJobInfo, path: Option<&Path>) {
        if let Some(cb) = self.on_complete.lock().unwrap().as_ref() {
            cb(code, job, path);
        }
    }
}

/// Basename of a URL path, query string stripped.
fn extract_filename(url: &str) -> Option<&str> {
    let name = url.rsplit('/').next()?;
    let name = name.split('?').next().unwrap_or(name);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_session::MockIotChannel;
    use crate::types::AuthMode;

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            instance_id: "inst".to_string(),
            product_key: "p".to_string(),
            product_secret: None,
            device_name: "d".to_string(),
            device_secret: Some("0123456789abcdef".to_string()),
            auth_mode: AuthMode::DeviceSecret,
        }
    }

    fn setup(dir: &Path) -> (Arc<MockIotChannel>, OtaManager) {
        let channel = Arc::new(MockIotChannel::new());
        let config = OtaConfig {
            download_dir: dir.join("downloads"),
            state_dir: dir.join("state"),
        };
        let manager = OtaManager::attach(
            channel.clone() as Arc<dyn IotChannel>,
            &identity(),
            &config,
            None,
        )
        .unwrap();
        (channel, manager)
    }

    fn published_json(channel: &MockIotChannel, topic: &str) -> Option<Value> {
        channel
            .published()
            .into_iter()
            .find(|(t, _)| t == topic)
            .map(|(_, p)| serde_json::from_slice(&p).unwrap())
    }

    #[test]
    fn test_attach_subscribes_ota_topics() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, _manager) = setup(dir.path());
        let topics = channel.subscribed_topics();
        assert!(topics.contains(&"sys/p/d/ota/notify/+".to_string()));
        assert!(topics.contains(&"sys/p/d/ota/upgrade/post_reply".to_string()));
    }

    #[test]
    fn test_set_modules_publishes_version_report() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        manager
            .set_modules(&[("default".to_string(), "1.0.0".to_string())])
            .unwrap();

        let report = published_json(&channel, "sys/p/d/ota/version").unwrap();
        assert_eq!(report["params"]["default"], "1.0.0");
        assert!(report["id"].is_string());
    }

    #[test]
    fn test_version_report_stable_apart_from_id() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        let modules = vec![("default".to_string(), "1.0.0".to_string())];
        manager.set_modules(&modules).unwrap();
        let first = published_json(&channel, "sys/p/d/ota/version").unwrap();
        channel.clear_published();
        manager.set_modules(&modules).unwrap();
        let second = published_json(&channel, "sys/p/d/ota/version").unwrap();
        assert_eq!(first["params"], second["params"]);
        assert_eq!(first["version"], second["version"]);
        assert_ne!(first["id"], second["id"]);
    }

    #[test]
    fn test_startup_reports_install_success_when_version_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());

        let kv = KvStore::open(&dir.path().join("state")).unwrap();
        kv.put(
            "key_save_job_info_default",
            r#"{"ota_job_id":"job-1","module":"default","dest_version":"2.0.0","url":"x","size":10}"#,
        )
        .unwrap();
        kv.put("key_save_task_info_job-1", r#"{"ota_file_path":"/tmp/x","decode_url":"u","retry_time":0,"upgrade_device_status":"Downloaded"}"#).unwrap();

        manager
            .set_modules(&[("default".to_string(), "2.0.0".to_string())])
            .unwrap();

        let progress = published_json(&channel, "sys/p/d/ota/progress/job-1").unwrap();
        assert_eq!(progress["params"]["status"], "Success");
        assert_eq!(progress["params"]["result_code"], 0);
        assert!(kv.get("key_save_job_info_default").is_none());
        assert!(kv.get("key_save_task_info_job-1").is_none());
    }

    #[test]
    fn test_notify_triggers_upgrade_request() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        manager
            .set_modules(&[("default".to_string(), "1.0.0".to_string())])
            .unwrap();
        channel.clear_published();

        channel.inject(
            "sys/p/d/ota/notify/job-7",
            br#"{"id":"n1","code":0,"data":{"type":"Upgrade","module":"default","dest_version":"1.1.0"}}"#,
        );

        let request = published_json(&channel, "sys/p/d/ota/upgrade/post").unwrap();
        assert_eq!(request["params"]["module"], "default");
        assert_eq!(request["params"]["src_version"], "1.0.0");
        assert_eq!(request["params"]["ota_job_id"], "job-7");
    }

    #[test]
    fn test_notify_for_unknown_module_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        manager
            .set_modules(&[("default".to_string(), "1.0.0".to_string())])
            .unwrap();
        channel.clear_published();

        channel.inject(
            "sys/p/d/ota/notify/job-8",
            br#"{"data":{"type":"Upgrade","module":"other"}}"#,
        );
        assert!(published_json(&channel, "sys/p/d/ota/upgrade/post").is_none());
    }

    #[test]
    fn test_upgrade_reply_persists_job_and_fires_callback() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.set_job_info_callback(Arc::new(move |job| {
            sink.lock().unwrap().push(job.clone());
        }));

        channel.inject(
            "sys/p/d/ota/upgrade/post_reply",
            br#"{"id":"r1","code":0,"data":{"ota_job_id":"job-9","module":"default","dest_version":"1.1.0","url":"ZW5j","size":100,"sign":"abcd","timeout_in_minutes":100}}"#,
        );

        let jobs = seen.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "job-9");
        assert_eq!(jobs[0].size, 100);

        let kv = KvStore::open(&dir.path().join("state")).unwrap();
        let persisted: OtaJobInfo =
            serde_json::from_str(&kv.get("key_save_job_info_default").unwrap()).unwrap();
        assert_eq!(persisted.job_id, "job-9");
    }

    #[tokio::test]
    async fn test_download_rejects_job_without_url() {
        let dir = tempfile::tempdir().unwrap();
        let (_channel, manager) = setup(dir.path());
        let job = OtaJobInfo {
            job_id: "j".to_string(),
            module: "default".to_string(),
            dest_version: "2".to_string(),
            url: String::new(),
            timeout_minutes: 0,
            size: 0,
            sign: None,
        };
        assert!(matches!(
            manager.start_download(job).await,
            Err(OtaError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_download_bad_cipher_reports_decrypt_error() {
        let dir = tempfile::tempdir().unwrap();
        let (_channel, manager) = setup(dir.path());
        let job = OtaJobInfo {
            job_id: "j2".to_string(),
            module: "default".to_string(),
            dest_version: "2".to_string(),
            url: "!!!not-base64!!!".to_string(),
            timeout_minutes: 0,
            size: 10,
            sign: None,
        };
        assert!(matches!(
            manager.start_download(job).await,
            Err(OtaError::Decrypt(_))
        ));
    }

    #[tokio::test]
    async fn test_verified_existing_download_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());

        let file_path = dir.path().join("downloads").join("fw.bin");
        std::fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        std::fs::write(&file_path, b"package-bytes").unwrap();
        let sign = crypto::md5_hex(b"package-bytes");

        let job = OtaJobInfo {
            job_id: "j3".to_string(),
            module: "default".to_string(),
            dest_version: "2".to_string(),
            url: crypto::b64_encode(&crypto::aes_cbc_encrypt(
                b"https://cdn.example.com/fw.bin",
                "0123456789abcdef",
                true,
            )),
            timeout_minutes: 0,
            size: 13,
            sign: Some(sign.clone()),
        };
        manager.inner.tasks.lock().unwrap().insert(
            "j3".to_string(),
            OtaTask {
                job: job.clone(),
                decoded_url: "https://cdn.example.com/fw.bin".to_string(),
                file_path: file_path.clone(),
                retry_count: 0,
                is_pending_retry: true,
                status: UpgradeDeviceStatus::Downloaded,
            },
        );

        let done = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&done);
        manager.set_download_complete_callback(Arc::new(move |code, _job, path| {
            *sink.lock().unwrap() = Some((code, path.map(Path::to_path_buf)));
        }));

        let path = manager.start_download(job).await.unwrap();
        assert_eq!(path, file_path);
        let progress = published_json(&channel, "sys/p/d/ota/progress/j3").unwrap();
        assert_eq!(progress["params"]["status"], "Downloaded");
        let (code, cb_path) = done.lock().unwrap().clone().unwrap();
        assert_eq!(code, 0);
        assert_eq!(cb_path.unwrap(), file_path);
    }

    #[test]
    fn test_install_failed_marks_pending_retry() {
        let dir = tempfile::tempdir().unwrap();
        let (channel, manager) = setup(dir.path());
        manager.inner.tasks.lock().unwrap().insert(
            "j4".to_string(),
            OtaTask {
                job: OtaJobInfo {
                    job_id: "j4".to_string(),
                    module: "default".to_string(),
                    dest_version: "2".to_string(),
                    url: String::new(),
                    timeout_minutes: 0,
                    size: 0,
                    sign: None,
                },
                decoded_url: String::new(),
                file_path: PathBuf::new(),
                retry_count: 0,
                is_pending_retry: false,
                status: UpgradeDeviceStatus::Installing,
            },
        );

        manager.report_install_failed("j4", "flash write error");
        assert!(manager.inner.tasks.lock().unwrap()["j4"].is_pending_retry);
        let progress = published_json(&channel, "sys/p/d/ota/progress/j4").unwrap();
        assert_eq!(progress["params"]["status"], "Failed");
        assert_eq!(progress["params"]["result_desc"], "flash write error");
        assert_ne!(progress["params"]["result_code"], 0);
    }

    #[test]
    fn test_extract_filename() {
        assert_eq!(
            extract_filename("https://cdn.example.com/pkg/fw-1.1.0.bin?sig=abc"),
            Some("fw-1.1.0.bin")
        );
        assert_eq!(extract_filename("https://cdn.example.com/"), None);
        assert_eq!(extract_filename("fw.bin"), Some("fw.bin"));
    }
}
