//! Long-running operations
//!
//! Create-then-attach for volumes, and the delayed list refresh that
//! follows every mutation.

use super::error::{format_api_error, ApiError, Result};
use super::model::{FloatingIp, Instance, KeystoneUser, SecurityGroup, Volume};
use super::ops::{CloudOperations, CreateVolumeParams};
use super::poll::{poll_until, PollPolicy};
use super::session::AuthSession;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Wait after attach, detach, create, delete and power actions.
pub const MUTATION_REFRESH_DELAY: Duration = Duration::from_secs(3);
/// Wait after a create-and-attach completes.
pub const CREATE_ATTACH_REFRESH_DELAY: Duration = Duration::from_secs(2);

pub const VOLUME_NOT_AVAILABLE: &str = "Volume did not become available in time for attachment";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateAttachRequest {
    pub volume: CreateVolumeParams,
    pub instance_id: String,
}

/// Create a volume, wait for it to become `available`, then attach it.
///
/// Returns the volume as last observed before the attach call. Nothing is
/// attached when the wait times out, fails, or is cancelled.
pub async fn create_and_attach_volume(
    ops: &dyn CloudOperations,
    token: &str,
    compute_url: &str,
    volume_url: &str,
    request: &CreateAttachRequest,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<Volume> {
    let params = placement(ops, token, compute_url, request).await?;
    let created = ops.create_volume(token, volume_url, &params).await?;
    tracing::info!(
        "Created volume {} ({}), waiting for it to become available",
        created.id,
        created.status
    );

    let volume_id = created.id.as_str();
    let ready = poll_until(
        policy,
        cancel,
        || async move {
            let volumes = ops.list_volumes(token, volume_url).await?;
            Ok(volumes.into_iter().find(|v| v.id == volume_id))
        },
        |found| match found {
            Some(v) if v.status.eq_ignore_ascii_case("error") => Err(ApiError::VolumeFailed {
                volume_id: v.id.clone(),
                status: v.status.clone(),
            }),
            Some(v) => Ok(v.is_available()),
            // Not listed yet
            None => Ok(false),
        },
        |attempts| ApiError::Timeout {
            message: VOLUME_NOT_AVAILABLE.to_string(),
            attempts,
        },
    )
    .await?;

    let volume = ready.unwrap_or(created);
    tracing::info!("Attaching volume {} to {}", volume.id, request.instance_id);
    ops.attach_volume(token, compute_url, &request.instance_id, &volume.id)
        .await?;
    Ok(volume)
}

/// Volume parameters with the zone defaulted to the instance's, so the
/// attach does not cross availability zones.
async fn placement(
    ops: &dyn CloudOperations,
    token: &str,
    compute_url: &str,
    request: &CreateAttachRequest,
) -> Result<CreateVolumeParams> {
    let mut params = request.volume.clone();
    if params.availability_zone.is_none() {
        let instance = ops.get_instance(token, compute_url, &request.instance_id).await?;
        params.availability_zone = instance.availability_zone;
    }
    Ok(params)
}

/// List re-fetched by a scheduled refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTarget {
    Instances,
    Volumes,
    FloatingIps,
    SecurityGroups,
    Users,
}

impl fmt::Display for RefreshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefreshTarget::Instances => "instances",
            RefreshTarget::Volumes => "volumes",
            RefreshTarget::FloatingIps => "floating IPs",
            RefreshTarget::SecurityGroups => "security groups",
            RefreshTarget::Users => "users",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshEvent {
    Instances(Vec<Instance>),
    Volumes(Vec<Volume>),
    FloatingIps(Vec<FloatingIp>),
    SecurityGroups(Vec<SecurityGroup>),
    Users(Vec<KeystoneUser>),
    Failed {
        target: RefreshTarget,
        message: String,
    },
}

/// Spawns delayed re-fetches and reports them on a channel.
///
/// Dropping the scheduler cancels every pending refresh.
pub struct RefreshScheduler {
    ops: Arc<dyn CloudOperations>,
    session: Arc<AuthSession>,
    tx: mpsc::Sender<RefreshEvent>,
    cancel: CancellationToken,
}

impl RefreshScheduler {
    pub fn new(
        ops: Arc<dyn CloudOperations>,
        session: Arc<AuthSession>,
    ) -> (Self, mpsc::Receiver<RefreshEvent>) {
        let (tx, rx) = mpsc::channel(32);
        let scheduler = Self {
            ops,
            session,
            tx,
            cancel: CancellationToken::new(),
        };
        (scheduler, rx)
    }

    /// Token cancelled together with the scheduler.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Re-fetch `target` from `base_url` after `delay`.
    pub fn schedule(&self, delay: Duration, target: RefreshTarget, base_url: String) {
        let ops = Arc::clone(&self.ops);
        let session = Arc::clone(&self.session);
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();

        tracing::debug!("Refreshing {} in {:?}", target, delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Refresh of {} cancelled", target);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let token = session.token.as_str();
            let event = match refetch(ops.as_ref(), token, &base_url, target).await {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Refresh of {} failed: {}", target, e);
                    RefreshEvent::Failed {
                        target,
                        message: format_api_error(&e),
                    }
                }
            };

            if cancel.is_cancelled() {
                return;
            }
            if tx.send(event).await.is_err() {
                tracing::trace!("Refresh receiver dropped");
            }
        });
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn refetch(
    ops: &dyn CloudOperations,
    token: &str,
    base_url: &str,
    target: RefreshTarget,
) -> Result<RefreshEvent> {
    Ok(match target {
        RefreshTarget::Instances => RefreshEvent::Instances(ops.list_instances(token, base_url).await?),
        RefreshTarget::Volumes => RefreshEvent::Volumes(ops.list_volumes(token, base_url).await?),
        RefreshTarget::FloatingIps => {
            RefreshEvent::FloatingIps(ops.list_floating_ips(token, base_url).await?)
        }
        RefreshTarget::SecurityGroups => {
            RefreshEvent::SecurityGroups(ops.list_security_groups(token, base_url).await?)
        }
        RefreshTarget::Users => RefreshEvent::Users(ops.list_users(token, base_url).await?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::mock::{mock_session, MockBackend, MockTimings};
    use pretty_assertions::assert_eq;

    const C: &str = "http://mock-api.local/compute/v2.1/mock-project-id";
    const V: &str = "http://mock-api.local/volume/v3/mock-project-id";

    fn request(instance_id: &str) -> CreateAttachRequest {
        CreateAttachRequest {
            volume: CreateVolumeParams {
                name: "scratch".into(),
                size: 5,
                ..Default::default()
            },
            instance_id: instance_id.into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_attach_attaches_once_available() {
        let mock = MockBackend::default();
        let start = tokio::time::Instant::now();

        let volume = create_and_attach_volume(
            &mock,
            "t",
            C,
            V,
            &request("inst-1"),
            &PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        // instance read, create, then available at 3.4s; seen by the first poll
        assert!(start.elapsed() < Duration::from_secs(9));

        let volumes = mock.list_volumes("t", V).await.unwrap();
        let attached = volumes.iter().find(|v| v.id == volume.id).unwrap();
        assert_eq!(attached.status, "in-use");
        assert_eq!(attached.attached_to(), Some("inst-1"));

        let instance = mock.get_instance("t", C, "inst-1").await.unwrap();
        assert!(instance.volumes_attached.contains(&volume.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_follows_instance_zone() {
        let mock = MockBackend::default();
        let volume = create_and_attach_volume(
            &mock,
            "t",
            C,
            V,
            &request("inst-1"),
            &PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(volume.availability_zone.as_deref(), Some("nova"));

        let mut pinned = request("inst-1");
        pinned.volume.availability_zone = Some("cinder-az1".into());
        let volume = create_and_attach_volume(
            &mock,
            "t",
            C,
            V,
            &pinned,
            &PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(volume.availability_zone.as_deref(), Some("cinder-az1"));
    }

    #[tokio::test]
    async fn test_remote_create_sends_instance_zone() {
        use crate::openstack::client::HttpClient;
        use crate::openstack::remote::RemoteBackend;
        use serde_json::json;
        use wiremock::matchers::{body_partial_json, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/compute/servers/inst-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "inst-9", "name": "app", "status": "ACTIVE",
                           "OS-EXT-AZ:availability_zone": "az-2"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/volume/volumes"))
            .and(body_partial_json(json!({
                "volume": {"name": "scratch", "size": 5, "availability_zone": "az-2"}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "volume": {"id": "vol-new", "name": "scratch", "size": 5,
                           "status": "creating", "availability_zone": "az-2"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/volume/volumes/detail"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "volumes": [{"id": "vol-new", "name": "scratch", "size": 5,
                             "status": "available", "availability_zone": "az-2"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/compute/servers/inst-9/os-volume_attachments"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let remote = RemoteBackend::new(HttpClient::new().unwrap());
        let policy = PollPolicy {
            max_attempts: 3,
            interval: Duration::from_millis(10),
        };
        let volume = create_and_attach_volume(
            &remote,
            "t",
            &format!("{}/compute", server.uri()),
            &format!("{}/volume", server.uri()),
            &request("inst-9"),
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(volume.id, "vol-new");
        assert_eq!(volume.availability_zone.as_deref(), Some("az-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_skips_attach() {
        // Volume takes longer to settle than the poll budget
        let mock = MockBackend::new(MockTimings {
            transition: Duration::from_secs(60),
            ..MockTimings::default()
        });

        let err = create_and_attach_volume(
            &mock,
            "t",
            C,
            V,
            &request("inst-1"),
            &PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ApiError::Timeout { message, attempts } => {
                assert_eq!(message, VOLUME_NOT_AVAILABLE);
                assert_eq!(attempts, 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let instance = mock.get_instance("t", C, "inst-1").await.unwrap();
        assert!(instance.volumes_attached.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_skips_attach() {
        let mock = Arc::new(MockBackend::new(MockTimings {
            transition: Duration::from_secs(60),
            ..MockTimings::default()
        }));
        let cancel = CancellationToken::new();

        let handle = {
            let mock = Arc::clone(&mock);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                create_and_attach_volume(
                    mock.as_ref(),
                    "t",
                    C,
                    V,
                    &request("inst-1"),
                    &PollPolicy::default(),
                    &cancel,
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(ApiError::Cancelled)));
        let instance = mock.get_instance("t", C, "inst-1").await.unwrap();
        assert!(instance.volumes_attached.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_emits_list_after_delay() {
        let ops: Arc<dyn CloudOperations> = Arc::new(MockBackend::default());
        let (scheduler, mut rx) = RefreshScheduler::new(ops, Arc::new(mock_session()));
        let start = tokio::time::Instant::now();

        scheduler.schedule(MUTATION_REFRESH_DELAY, RefreshTarget::Volumes, V.to_string());

        match rx.recv().await {
            Some(RefreshEvent::Volumes(volumes)) => assert_eq!(volumes.len(), 4),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(start.elapsed() >= MUTATION_REFRESH_DELAY);
    }

    #[tokio::test]
    async fn test_refresh_failure_is_reported() {
        let client = crate::openstack::client::HttpClient::new().unwrap();
        let remote: Arc<dyn CloudOperations> =
            Arc::new(crate::openstack::remote::RemoteBackend::new(client));
        let (scheduler, mut rx) = RefreshScheduler::new(remote, Arc::new(mock_session()));

        // Nothing listens on port 9
        scheduler.schedule(
            Duration::from_millis(10),
            RefreshTarget::Instances,
            "http://127.0.0.1:9/compute".to_string(),
        );
        match rx.recv().await {
            Some(RefreshEvent::Failed { target, message }) => {
                assert_eq!(target, RefreshTarget::Instances);
                assert!(!message.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_pending_refresh() {
        let ops: Arc<dyn CloudOperations> = Arc::new(MockBackend::default());
        let (scheduler, mut rx) = RefreshScheduler::new(ops, Arc::new(mock_session()));
        scheduler.schedule(MUTATION_REFRESH_DELAY, RefreshTarget::Instances, C.to_string());
        drop(scheduler);

        assert!(rx.recv().await.is_none());
    }
}
