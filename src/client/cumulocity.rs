//! Standalone HTTP client for the Cumulocity REST API (identity, inventory
//! and microservice application endpoints).
//!
//! - Blocking client using `ureq` (no async).
//! - Basic authentication: the bootstrap user enumerates subscriptions, every
//!   tenant-scoped call authenticates as that tenant's service user.

use http::StatusCode;
use std::time::{Duration, Instant};

use crate::client::rest::{self, ClientError, Reply};
use crate::models::c8y::*;
use crate::services::platform::{Platform, SubscriptionRegistry};

pub struct CumulocityClient {
    agent: ureq::Agent,
    timeout: Duration,
    base_url: String,
    bootstrap: ServiceUser,
}

impl CumulocityClient {
    pub fn new(base_url: &str, bootstrap: ServiceUser, timeout: Duration) -> Self {
        CumulocityClient {
            agent: rest::agent(timeout),
            timeout,
            base_url: base_url.trim_end_matches('/').to_string(),
            bootstrap,
        }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn get(&self, user: &ServiceUser, path: &str, deadline: Instant) -> Result<Reply, ClientError> {
        let timeout = rest::budget(self.timeout, deadline)?;
        Reply::read(
            self.agent
                .get(&self.url(path))
                .config()
                .timeout_global(Some(timeout))
                .build()
                .header("Accept", "application/json")
                .header("Authorization", rest::basic_auth(user))
                .call(),
        )
    }

    fn post<T: serde::Serialize>(
        &self,
        user: &ServiceUser,
        path: &str,
        body: &T,
        deadline: Instant,
    ) -> Result<Reply, ClientError> {
        let timeout = rest::budget(self.timeout, deadline)?;
        Reply::read(
            self.agent
                .post(&self.url(path))
                .config()
                .timeout_global(Some(timeout))
                .build()
                .header("Accept", "application/json")
                .header("Authorization", rest::basic_auth(user))
                .send_json(body),
        )
    }

    fn put<T: serde::Serialize>(
        &self,
        user: &ServiceUser,
        path: &str,
        body: &T,
        deadline: Instant,
    ) -> Result<Reply, ClientError> {
        let timeout = rest::budget(self.timeout, deadline)?;
        Reply::read(
            self.agent
                .put(&self.url(path))
                .config()
                .timeout_global(Some(timeout))
                .build()
                .header("Accept", "application/json")
                .header("Authorization", rest::basic_auth(user))
                .send_json(body),
        )
    }
}

/// Map the identity lookup reply: only a 404 means the id is unknown.
fn lookup_from_reply(reply: Reply) -> Result<ExternalIdLookup, ClientError> {
    match reply.status {
        StatusCode::NOT_FOUND => Ok(ExternalIdLookup::Absent),
        s if s.is_success() => {
            let binding: ExternalIdBinding = reply.json()?;
            Ok(ExternalIdLookup::Found(binding.managed_object))
        }
        _ => Err(reply.into_error()),
    }
}

impl Platform for CumulocityClient {
    fn find_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        deadline: Instant,
    ) -> Result<ExternalIdLookup, ClientError> {
        let path = format!("/identity/externalIds/{}/{}", external_id.id_type, external_id.value);
        lookup_from_reply(self.get(&tenant.user, &path, deadline)?)
    }

    fn create_device(
        &self,
        tenant: &TenantContext,
        device: &NewDevice,
        deadline: Instant,
    ) -> Result<DeviceRecord, ClientError> {
        self.post(&tenant.user, "/inventory/managedObjects", device, deadline)?
            .success()?
            .json()
    }

    fn bind_external_id(
        &self,
        tenant: &TenantContext,
        external_id: &ExternalId,
        device: &ManagedObjectId,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        let path = format!("/identity/globalIds/{}/externalIds", device.0);
        self.post(&tenant.user, &path, external_id, deadline)?.success()?;
        Ok(())
    }

    fn update_device(
        &self,
        tenant: &TenantContext,
        update: &DeviceUpdate,
        deadline: Instant,
    ) -> Result<(), ClientError> {
        let path = format!("/inventory/managedObjects/{}", update.id.0);
        self.put(&tenant.user, &path, update, deadline)?.success()?;
        Ok(())
    }

    fn tenant_settings(
        &self,
        tenant: &TenantContext,
        deadline: Instant,
    ) -> Result<Vec<ApplicationSetting>, ClientError> {
        self.get(&tenant.user, "/application/currentApplication/settings", deadline)?
            .success()?
            .json()
    }
}

impl SubscriptionRegistry for CumulocityClient {
    fn subscribed_tenants(&self) -> Result<Vec<TenantContext>, ClientError> {
        let deadline = Instant::now() + self.timeout;
        let subs: Subscriptions = self
            .get(&self.bootstrap, "/application/currentApplication/subscriptions", deadline)?
            .success()?
            .json()?;
        Ok(subs.users.into_iter().map(TenantContext::new).collect())
    }
}
