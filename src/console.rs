//! Console facade
//!
//! What the front end calls. Resolves the service endpoint before touching
//! the backend, joins the fetches a view needs, and schedules a list
//! refresh after every mutation.

use crate::openstack::catalog::EndpointSelector;
use crate::openstack::error::{Result, ServiceKind};
use crate::openstack::model::{
    ConsoleInfo, Flavor, FloatingIp, Image, Instance, InstanceAction, KeyPair, KeystoneDomain,
    KeystoneUser, Network, Port, Quota, Router, SecurityGroup, SecurityGroupRule, Subnet, Volume,
};
use crate::openstack::normalize::backfill_names;
use crate::openstack::ops::{
    CloudOperations, ConsoleType, CreateUserRequest, CreateVolumeParams, LaunchInstanceParams,
    NewSecurityGroupRule, PortQuery, PowerAction, UserUpdate,
};
use crate::openstack::orchestrator::{
    create_and_attach_volume, CreateAttachRequest, RefreshEvent, RefreshScheduler, RefreshTarget,
    CREATE_ATTACH_REFRESH_DELAY, MUTATION_REFRESH_DELAY,
};
use crate::openstack::poll::PollPolicy;
use crate::openstack::session::AuthSession;
use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything the instance detail view shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceDetail {
    pub instance: Instance,
    pub flavor: Option<Flavor>,
    pub image: Option<Image>,
    pub volumes: Vec<Volume>,
    /// Available volumes in the instance's zone.
    pub attachable_volumes: Vec<Volume>,
    pub security_groups: Vec<SecurityGroup>,
}

/// `start_time` as Nova (no offset) or RFC 3339 writes it.
fn action_time(action: &InstanceAction) -> Option<NaiveDateTime> {
    let raw = action.start_time.trim();
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Newest first. Unparseable times sink to the end.
fn sort_newest_first(actions: &mut [InstanceAction]) {
    actions.sort_by(|a, b| action_time(b).cmp(&action_time(a)));
}

pub struct Console {
    ops: Arc<dyn CloudOperations>,
    session: Arc<AuthSession>,
    selector: EndpointSelector,
    poll: PollPolicy,
    refresh: RefreshScheduler,
}

impl Console {
    pub fn new(
        ops: Arc<dyn CloudOperations>,
        session: Arc<AuthSession>,
        selector: EndpointSelector,
    ) -> (Self, mpsc::Receiver<RefreshEvent>) {
        let (refresh, events) = RefreshScheduler::new(Arc::clone(&ops), Arc::clone(&session));
        let console = Self {
            ops,
            session,
            selector,
            poll: PollPolicy::default(),
            refresh,
        };
        (console, events)
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn backend_name(&self) -> &'static str {
        self.ops.backend_name()
    }

    fn token(&self) -> &str {
        self.session.token.as_str()
    }

    fn url(&self, kind: ServiceKind) -> Result<String> {
        self.session.endpoint(kind, &self.selector)
    }

    fn refresh_after(&self, delay: Duration, target: RefreshTarget) {
        let kind = match target {
            RefreshTarget::Instances => ServiceKind::Compute,
            RefreshTarget::Volumes => ServiceKind::Volume,
            RefreshTarget::FloatingIps | RefreshTarget::SecurityGroups => ServiceKind::Network,
            RefreshTarget::Users => ServiceKind::Identity,
        };
        match self.url(kind) {
            Ok(url) => self.refresh.schedule(delay, target, url),
            Err(e) => tracing::warn!("Skipping refresh of {}: {}", target, e),
        }
    }

    // Compute

    /// Instances with flavor and image names filled in where they can be.
    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        let compute = self.url(ServiceKind::Compute)?;
        let token = self.token();

        let (instances, flavors, images) = tokio::join!(
            self.ops.list_instances(token, &compute),
            self.ops.list_flavors(token, &compute),
            async {
                let url = self.url(ServiceKind::Image)?;
                self.ops.list_images(token, &url).await
            },
        );

        let mut instances = instances?;
        let flavors = flavors.unwrap_or_else(|e| {
            tracing::warn!("Flavor names unavailable: {}", e);
            Vec::new()
        });
        let images = images.unwrap_or_else(|e| {
            tracing::warn!("Image names unavailable: {}", e);
            Vec::new()
        });
        for instance in instances.iter_mut() {
            backfill_names(instance, &flavors, &images);
        }
        Ok(instances)
    }

    pub async fn instance_detail(&self, instance_id: &str) -> Result<InstanceDetail> {
        let compute = self.url(ServiceKind::Compute)?;
        let volume = self.url(ServiceKind::Volume)?;
        let image = self.url(ServiceKind::Image)?;
        let network = self.url(ServiceKind::Network)?;
        let token = self.token();

        let (mut instance, volumes, flavors, images, groups) = tokio::try_join!(
            self.ops.get_instance(token, &compute, instance_id),
            self.ops.list_volumes(token, &volume),
            self.ops.list_flavors(token, &compute),
            self.ops.list_images(token, &image),
            self.ops.list_security_groups(token, &network),
        )?;

        backfill_names(&mut instance, &flavors, &images);
        let flavor = flavors.into_iter().find(|f| f.id == instance.flavor.id);
        let image = images.into_iter().find(|i| i.id == instance.image.id);
        let zone = instance.availability_zone.as_deref();
        let mut attached = Vec::new();
        let mut attachable_volumes = Vec::new();
        for v in volumes {
            let on_instance = v.attached_to() == Some(instance.id.as_str())
                || instance.volumes_attached.contains(&v.id);
            let same_zone = zone.is_none() || v.availability_zone.as_deref() == zone;
            if on_instance {
                attached.push(v);
            } else if v.is_available() && same_zone {
                attachable_volumes.push(v);
            }
        }
        let security_groups = groups
            .into_iter()
            .filter(|g| instance.security_groups.contains(&g.name))
            .collect();

        Ok(InstanceDetail {
            instance,
            flavor,
            image,
            volumes: attached,
            attachable_volumes,
            security_groups,
        })
    }

    pub async fn launch_instance(&self, params: &LaunchInstanceParams) -> Result<Instance> {
        let compute = self.url(ServiceKind::Compute)?;
        let instance = self
            .ops
            .launch_instance(self.token(), &compute, params)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(instance)
    }

    pub async fn terminate_instance(&self, instance_id: &str) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .terminate_instance(self.token(), &compute, instance_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    pub async fn control_instance_power(&self, instance_id: &str, action: PowerAction) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .control_instance_power(self.token(), &compute, instance_id, action)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    pub async fn shelve_instance(&self, instance_id: &str) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .shelve_instance(self.token(), &compute, instance_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    pub async fn unshelve_instance(&self, instance_id: &str) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .unshelve_instance(self.token(), &compute, instance_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    pub async fn console_url(&self, instance_id: &str, console_type: ConsoleType) -> Result<ConsoleInfo> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .get_console_url(self.token(), &compute, instance_id, console_type)
            .await
    }

    pub async fn instance_actions(&self, instance_id: &str) -> Result<Vec<InstanceAction>> {
        let compute = self.url(ServiceKind::Compute)?;
        let mut actions = self
            .ops
            .list_instance_actions(self.token(), &compute, instance_id)
            .await?;
        sort_newest_first(&mut actions);
        Ok(actions)
    }

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops.list_flavors(self.token(), &compute).await
    }

    pub async fn list_key_pairs(&self) -> Result<Vec<KeyPair>> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops.list_key_pairs(self.token(), &compute).await
    }

    // Block storage

    pub async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let volume = self.url(ServiceKind::Volume)?;
        self.ops.list_volumes(self.token(), &volume).await
    }

    pub async fn create_volume(&self, params: &CreateVolumeParams) -> Result<Volume> {
        let volume = self.url(ServiceKind::Volume)?;
        let created = self.ops.create_volume(self.token(), &volume, params).await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Volumes);
        Ok(created)
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let volume = self.url(ServiceKind::Volume)?;
        self.ops.delete_volume(self.token(), &volume, volume_id).await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Volumes);
        Ok(())
    }

    /// Attach, then refresh both sides of the attachment.
    pub async fn attach_volume(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .attach_volume(self.token(), &compute, instance_id, volume_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Volumes);
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    /// Detach by volume id, then refresh both sides.
    pub async fn detach_volume(&self, instance_id: &str, volume_id: &str) -> Result<()> {
        let compute = self.url(ServiceKind::Compute)?;
        self.ops
            .detach_volume(self.token(), &compute, instance_id, volume_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Volumes);
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(())
    }

    pub async fn create_and_attach_volume(&self, request: &CreateAttachRequest) -> Result<Volume> {
        let compute = self.url(ServiceKind::Compute)?;
        let volume = self.url(ServiceKind::Volume)?;
        let cancel = self.refresh.cancel_token();

        let attached = create_and_attach_volume(
            self.ops.as_ref(),
            self.token(),
            &compute,
            &volume,
            request,
            &self.poll,
            &cancel,
        )
        .await?;

        self.refresh_after(CREATE_ATTACH_REFRESH_DELAY, RefreshTarget::Volumes);
        self.refresh_after(CREATE_ATTACH_REFRESH_DELAY, RefreshTarget::Instances);
        Ok(attached)
    }

    // Network

    pub async fn list_networks(&self) -> Result<Vec<Network>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_networks(self.token(), &network).await
    }

    pub async fn list_subnets(&self, network_id: Option<&str>) -> Result<Vec<Subnet>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_subnets(self.token(), &network, network_id).await
    }

    pub async fn list_routers(&self) -> Result<Vec<Router>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_routers(self.token(), &network).await
    }

    pub async fn list_ports(&self, query: &PortQuery) -> Result<Vec<Port>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_ports(self.token(), &network, query).await
    }

    pub async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_floating_ips(self.token(), &network).await
    }

    pub async fn allocate_floating_ip(&self, pool_network_id: &str) -> Result<FloatingIp> {
        let network = self.url(ServiceKind::Network)?;
        let fip = self
            .ops
            .allocate_floating_ip(self.token(), &network, pool_network_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::FloatingIps);
        Ok(fip)
    }

    pub async fn release_floating_ip(&self, fip_id: &str) -> Result<()> {
        let network = self.url(ServiceKind::Network)?;
        self.ops
            .release_floating_ip(self.token(), &network, fip_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::FloatingIps);
        Ok(())
    }

    pub async fn associate_floating_ip(&self, fip_id: &str, port_id: &str) -> Result<FloatingIp> {
        let network = self.url(ServiceKind::Network)?;
        let fip = self
            .ops
            .associate_floating_ip(self.token(), &network, fip_id, port_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::FloatingIps);
        Ok(fip)
    }

    pub async fn disassociate_floating_ip(&self, fip_id: &str) -> Result<FloatingIp> {
        let network = self.url(ServiceKind::Network)?;
        let fip = self
            .ops
            .disassociate_floating_ip(self.token(), &network, fip_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::FloatingIps);
        Ok(fip)
    }

    pub async fn list_security_groups(&self) -> Result<Vec<SecurityGroup>> {
        let network = self.url(ServiceKind::Network)?;
        self.ops.list_security_groups(self.token(), &network).await
    }

    pub async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let network = self.url(ServiceKind::Network)?;
        let group = self
            .ops
            .create_security_group(self.token(), &network, name, description)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::SecurityGroups);
        Ok(group)
    }

    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        let network = self.url(ServiceKind::Network)?;
        self.ops
            .delete_security_group(self.token(), &network, group_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::SecurityGroups);
        Ok(())
    }

    pub async fn add_security_group_rule(&self, rule: &NewSecurityGroupRule) -> Result<SecurityGroupRule> {
        let network = self.url(ServiceKind::Network)?;
        let created = self
            .ops
            .add_security_group_rule(self.token(), &network, rule)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::SecurityGroups);
        Ok(created)
    }

    pub async fn delete_security_group_rule(&self, rule_id: &str) -> Result<()> {
        let network = self.url(ServiceKind::Network)?;
        self.ops
            .delete_security_group_rule(self.token(), &network, rule_id)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::SecurityGroups);
        Ok(())
    }

    // Image

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        let image = self.url(ServiceKind::Image)?;
        self.ops.list_images(self.token(), &image).await
    }

    // Quotas

    pub async fn quotas(&self) -> Result<Vec<Quota>> {
        self.ops
            .fetch_all_quotas(
                self.token(),
                &self.session.catalog,
                &self.selector,
                self.session.project_id(),
            )
            .await
    }

    // Identity

    pub async fn list_domains(&self) -> Result<Vec<KeystoneDomain>> {
        let identity = self.url(ServiceKind::Identity)?;
        self.ops.list_domains(self.token(), &identity).await
    }

    pub async fn list_users(&self) -> Result<Vec<KeystoneUser>> {
        let identity = self.url(ServiceKind::Identity)?;
        self.ops.list_users(self.token(), &identity).await
    }

    pub async fn create_user(&self, request: &CreateUserRequest) -> Result<KeystoneUser> {
        let identity = self.url(ServiceKind::Identity)?;
        let user = self.ops.create_user(self.token(), &identity, request).await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Users);
        Ok(user)
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let identity = self.url(ServiceKind::Identity)?;
        self.ops.delete_user(self.token(), &identity, user_id).await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Users);
        Ok(())
    }

    pub async fn update_user(&self, user_id: &str, update: &UserUpdate) -> Result<KeystoneUser> {
        let identity = self.url(ServiceKind::Identity)?;
        let user = self
            .ops
            .update_user(self.token(), &identity, user_id, update)
            .await?;
        self.refresh_after(MUTATION_REFRESH_DELAY, RefreshTarget::Users);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openstack::error::ApiError;
    use crate::openstack::mock::{mock_session, MockBackend};
    use pretty_assertions::assert_eq;

    fn mock_console() -> (Console, mpsc::Receiver<RefreshEvent>) {
        Console::new(
            Arc::new(MockBackend::default()),
            Arc::new(mock_session()),
            EndpointSelector::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_endpoint_fails_before_backend_call() {
        let mut session = mock_session();
        session.catalog.retain(|entry| entry.service_type != "volumev3");
        let (console, _events) = Console::new(
            Arc::new(MockBackend::default()),
            Arc::new(session),
            EndpointSelector::default(),
        );

        let err = console.list_volumes().await.unwrap_err();
        assert!(matches!(err, ApiError::EndpointNotFound(ServiceKind::Volume)));
        assert_eq!(err.to_string(), "Volume service endpoint not found.");

        let err = console.instance_detail("inst-2").await.unwrap_err();
        assert!(matches!(err, ApiError::EndpointNotFound(ServiceKind::Volume)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_detail_joins_related_resources() {
        let (console, _events) = mock_console();
        let detail = console.instance_detail("inst-2").await.unwrap();

        assert_eq!(detail.instance.name, "db-server-01");
        assert_eq!(detail.flavor.map(|f| f.name), Some("m1.medium".to_string()));
        assert_eq!(detail.image.map(|i| i.id), Some("img-2".to_string()));
        assert_eq!(
            detail.volumes.iter().map(|v| v.id.as_str()).collect::<Vec<_>>(),
            vec!["vol-2"]
        );
        let mut groups: Vec<_> = detail.security_groups.iter().map(|g| g.name.as_str()).collect();
        groups.sort();
        assert_eq!(groups, vec!["db-sg", "default"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_detail_lists_attachable_volumes_in_zone() {
        let (console, _events) = mock_console();
        let detail = console.instance_detail("inst-2").await.unwrap();

        // vol-3 is available but lives in cinder-az1
        assert_eq!(
            detail
                .attachable_volumes
                .iter()
                .map(|v| v.id.as_str())
                .collect::<Vec<_>>(),
            vec!["vol-1", "vol-4"]
        );

        console.attach_volume("inst-1", "vol-4").await.unwrap();
        let detail = console.instance_detail("inst-2").await.unwrap();
        assert_eq!(
            detail
                .attachable_volumes
                .iter()
                .map(|v| v.id.as_str())
                .collect::<Vec<_>>(),
            vec!["vol-1"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_actions_newest_first() {
        let (console, _events) = mock_console();
        let actions = console.instance_actions("inst-1").await.unwrap();
        assert_eq!(
            actions.iter().map(|a| a.action.as_str()).collect::<Vec<_>>(),
            vec!["reboot", "start", "stop", "create"]
        );
    }

    #[test]
    fn test_sort_handles_nova_and_rfc3339_times() {
        let action = |name: &str, start_time: &str| InstanceAction {
            action: name.to_string(),
            request_id: format!("req-{}", name),
            instance_uuid: "inst-1".to_string(),
            start_time: start_time.to_string(),
            message: None,
            user_id: None,
            project_id: None,
        };
        let mut actions = vec![
            action("create", "2024-03-01T10:00:00.000000"),
            action("garbled", "yesterday"),
            action("reboot", "2024-03-02T09:30:00+00:00"),
            action("stop", "2024-03-01T12:15:42.123456"),
        ];
        sort_newest_first(&mut actions);
        assert_eq!(
            actions.iter().map(|a| a.action.as_str()).collect::<Vec<_>>(),
            vec!["reboot", "stop", "create", "garbled"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_instances_without_image_service_still_lists() {
        let mut session = mock_session();
        session.catalog.retain(|entry| entry.service_type != "image");
        let (console, _events) = Console::new(
            Arc::new(MockBackend::default()),
            Arc::new(session),
            EndpointSelector::default(),
        );

        let instances = console.list_instances().await.unwrap();
        assert_eq!(instances.len(), 5);
        assert_eq!(instances[0].flavor.name.as_deref(), Some("m1.small"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_action_schedules_instance_refresh() {
        let (console, mut events) = mock_console();
        let start = tokio::time::Instant::now();

        console
            .control_instance_power("inst-1", PowerAction::Stop)
            .await
            .unwrap();

        match events.recv().await {
            Some(RefreshEvent::Instances(instances)) => {
                let inst = instances.iter().find(|i| i.id == "inst-1").unwrap();
                assert_eq!(inst.status, "SHUTOFF");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(start.elapsed() >= MUTATION_REFRESH_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_refreshes_both_sides() {
        let (console, mut events) = mock_console();
        console.attach_volume("inst-1", "vol-1").await.unwrap();

        let mut saw_volumes = false;
        let mut saw_instances = false;
        for _ in 0..2 {
            match events.recv().await {
                Some(RefreshEvent::Volumes(volumes)) => {
                    let vol = volumes.iter().find(|v| v.id == "vol-1").unwrap();
                    assert_eq!(vol.attached_to(), Some("inst-1"));
                    saw_volumes = true;
                }
                Some(RefreshEvent::Instances(instances)) => {
                    let inst = instances.iter().find(|i| i.id == "inst-1").unwrap();
                    assert!(inst.volumes_attached.contains(&"vol-1".to_string()));
                    saw_instances = true;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(saw_volumes && saw_instances);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_attach_through_console() {
        let (console, mut events) = mock_console();
        let volume = console
            .create_and_attach_volume(&CreateAttachRequest {
                volume: CreateVolumeParams {
                    name: "logs".into(),
                    size: 8,
                    ..Default::default()
                },
                instance_id: "inst-3".into(),
            })
            .await
            .unwrap();

        let detail = console.instance_detail("inst-3").await.unwrap();
        assert!(detail.volumes.iter().any(|v| v.id == volume.id));
        assert!(events.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quotas_use_session_project() {
        let (console, _events) = mock_console();
        let quotas = console.quotas().await.unwrap();
        assert_eq!(quotas.len(), 11);
        assert_eq!(quotas[0].resource, "Instances");
    }
}
