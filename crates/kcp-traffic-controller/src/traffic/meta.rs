//! Typed access to the annotations, labels and finalizers the controller keeps on objects.
//!
//! The keys below are a stable wire contract shared with other components and with previous
//! releases. Nothing outside this module reads them as raw strings.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// The host assigned by the controller.
pub const ANNOTATION_GENERATED_HOST: &str = "kuadrant.dev/host.generated";

/// Last known state of the certificate of the generated host.
pub const ANNOTATION_CERTIFICATE_STATE: &str = "kuadrant.dev/certificate-state";

/// JSON `{"rules": [...]}` of host rules waiting for domain verification.
pub const ANNOTATION_PENDING_CUSTOM_HOSTS: &str = "kuadrant.dev/pending-custom-hosts";

/// JSON list of hosts replaced by the generated host while custom hosts are disabled.
pub const ANNOTATION_CUSTOM_HOSTS_REPLACED: &str = "kuadrant.dev/custom-hosts.replaced";

/// `"true"` while the object has pending hosts.
pub const LABEL_HAS_PENDING_HOSTS: &str = "kuadrant.dev/custom-hosts.pending";

/// Marks a shadow object.
pub const ANNOTATION_SHADOW: &str = "kuadrant.dev/shadow";

/// Key of the traffic object owning a DNS Record, Secret or Certificate.
pub const ANNOTATION_TRAFFIC_KEY: &str = "kuadrant.dev/traffic-key";

/// Kind of the traffic object owning a DNS Record, Secret or Certificate.
pub const ANNOTATION_TRAFFIC_KIND: &str = "kuadrant.dev/traffic-kind";

/// Prefix of the annotations carrying the status reported by each remote cluster.
pub const REMOTE_STATUS_ANNOTATION_PREFIX: &str = "experimental.status.workload.kcp.io/";

/// Prefix of the annotations marking a remote cluster as tearing the workload down.
pub const REMOTE_DELETION_ANNOTATION_PREFIX: &str = "deletion.internal.workload.kcp.io/";

/// Prefix of the labels placing the object onto a remote cluster.
pub const SYNC_TARGET_LABEL_PREFIX: &str = "state.workload.kcp.io/";

/// Held until the owned certificate, secret and DNS Record are gone.
pub const CASCADE_CLEANUP_FINALIZER: &str = "kuadrant.dev/cascade-cleanup";

/// Held by a Route primary while it owns a shadow object.
pub const SHADOW_CLEANUP_FINALIZER: &str = "kuadrant.dev/shadow-cleanup";

/// The serialized form of the pending hosts annotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(bound(deserialize = "R: DeserializeOwned, T: DeserializeOwned"))]
pub struct PendingRules<R, T> {
    #[serde(default = "Vec::new")]
    pub rules: Vec<R>,

    /// TLS entries taken off the object together with `rules`.
    #[serde(default = "Vec::new", skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<T>,
}

impl<R, T> Default for PendingRules<R, T> {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            tls: Vec::new(),
        }
    }
}

/// [`ObjectMeta`] accessors for the controller's annotations, labels and finalizers.
pub trait TrafficMetaExt {
    fn annotation(&self, key: &str) -> Option<&str>;

    fn set_annotation(&mut self, key: &str, value: impl Into<String>);

    fn remove_annotation(&mut self, key: &str) -> Option<String>;

    fn label(&self, key: &str) -> Option<&str>;

    fn set_label(&mut self, key: &str, value: impl Into<String>);

    fn remove_label(&mut self, key: &str) -> Option<String>;

    /// The generated host, [`None`] if not assigned yet.
    fn generated_host(&self) -> Option<&str> {
        self.annotation(ANNOTATION_GENERATED_HOST)
            .filter(|host| !host.is_empty())
    }

    fn set_generated_host(&mut self, host: &str) {
        self.set_annotation(ANNOTATION_GENERATED_HOST, host);
    }

    fn certificate_state(&self) -> Option<&str> {
        self.annotation(ANNOTATION_CERTIFICATE_STATE)
    }

    fn set_certificate_state(&mut self, state: &str) {
        self.set_annotation(ANNOTATION_CERTIFICATE_STATE, state);
    }

    fn is_shadow(&self) -> bool {
        self.annotation(ANNOTATION_SHADOW).is_some()
    }

    /// Rules parked by custom host processing.
    fn pending_rules<R, T>(&self) -> Result<PendingRules<R, T>, serde_json::Error>
    where
        R: DeserializeOwned,
        T: DeserializeOwned,
    {
        match self.annotation(ANNOTATION_PENDING_CUSTOM_HOSTS) {
            None | Some("") => Ok(PendingRules::default()),
            Some(raw) => serde_json::from_str(raw),
        }
    }

    /// Stores `pending`, the label follows whether there are any rules.
    fn set_pending_rules<R, T>(
        &mut self,
        pending: &PendingRules<R, T>,
    ) -> Result<(), serde_json::Error>
    where
        R: Serialize,
        T: Serialize,
    {
        if pending.rules.is_empty() {
            self.remove_annotation(ANNOTATION_PENDING_CUSTOM_HOSTS);
            self.remove_label(LABEL_HAS_PENDING_HOSTS);
            return Ok(());
        }

        self.set_annotation(ANNOTATION_PENDING_CUSTOM_HOSTS, serde_json::to_string(pending)?);
        self.set_label(LABEL_HAS_PENDING_HOSTS, "true");
        Ok(())
    }

    fn has_pending_hosts(&self) -> bool {
        self.label(LABEL_HAS_PENDING_HOSTS) == Some("true")
    }

    fn set_replaced_hosts(&mut self, hosts: &[String]) -> Result<(), serde_json::Error> {
        if hosts.is_empty() {
            self.remove_annotation(ANNOTATION_CUSTOM_HOSTS_REPLACED);
        } else {
            self.set_annotation(ANNOTATION_CUSTOM_HOSTS_REPLACED, serde_json::to_string(hosts)?);
        }
        Ok(())
    }

    /// Status payloads keyed by sync target, decoded as `S`.
    fn remote_statuses<S: DeserializeOwned>(
        &self,
    ) -> Result<BTreeMap<String, S>, (String, serde_json::Error)>;

    fn has_remote_status(&self) -> bool;

    /// Sync targets currently tearing the workload down.
    fn deleting_sync_targets(&self) -> BTreeSet<String>;

    /// Sync targets the object is placed on.
    fn sync_targets(&self) -> Vec<String>;

    fn has_finalizer(&self, finalizer: &str) -> bool;

    /// Returns `true` if the finalizer was added.
    fn add_finalizer(&mut self, finalizer: &str) -> bool;

    /// Returns `true` if the finalizer was present.
    fn remove_finalizer(&mut self, finalizer: &str) -> bool;
}

fn prefixed<'a>(
    entries: Option<&'a BTreeMap<String, String>>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a str, &'a str)> {
    entries.into_iter().flatten().filter_map(move |(key, value)| {
        key.strip_prefix(prefix)
            .filter(|suffix| !suffix.is_empty())
            .map(|suffix| (suffix, value.as_str()))
    })
}

impl TrafficMetaExt for ObjectMeta {
    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.as_ref()?.get(key).map(String::as_str)
    }

    fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.into());
    }

    fn remove_annotation(&mut self, key: &str) -> Option<String> {
        let annotations = self.annotations.as_mut()?;
        let removed = annotations.remove(key);
        if annotations.is_empty() {
            self.annotations = None;
        }
        removed
    }

    fn label(&self, key: &str) -> Option<&str> {
        self.labels.as_ref()?.get(key).map(String::as_str)
    }

    fn set_label(&mut self, key: &str, value: impl Into<String>) {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_owned(), value.into());
    }

    fn remove_label(&mut self, key: &str) -> Option<String> {
        let labels = self.labels.as_mut()?;
        let removed = labels.remove(key);
        if labels.is_empty() {
            self.labels = None;
        }
        removed
    }

    fn remote_statuses<S: DeserializeOwned>(
        &self,
    ) -> Result<BTreeMap<String, S>, (String, serde_json::Error)> {
        prefixed(self.annotations.as_ref(), REMOTE_STATUS_ANNOTATION_PREFIX)
            .map(|(sync_target, raw)| {
                serde_json::from_str(raw)
                    .map(|status| (sync_target.to_owned(), status))
                    .map_err(|err| (format!("{REMOTE_STATUS_ANNOTATION_PREFIX}{sync_target}"), err))
            })
            .collect()
    }

    fn has_remote_status(&self) -> bool {
        prefixed(self.annotations.as_ref(), REMOTE_STATUS_ANNOTATION_PREFIX)
            .next()
            .is_some()
    }

    fn deleting_sync_targets(&self) -> BTreeSet<String> {
        prefixed(self.annotations.as_ref(), REMOTE_DELETION_ANNOTATION_PREFIX)
            .filter(|(_, timestamp)| !timestamp.is_empty())
            .map(|(sync_target, _)| sync_target.to_owned())
            .collect()
    }

    fn sync_targets(&self) -> Vec<String> {
        prefixed(self.labels.as_ref(), SYNC_TARGET_LABEL_PREFIX)
            .map(|(sync_target, _)| sync_target.to_owned())
            .collect()
    }

    fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers
            .iter()
            .flatten()
            .any(|existing| existing == finalizer)
    }

    fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers
            .get_or_insert_with(Vec::new)
            .push(finalizer.to_owned());
        true
    }

    fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let Some(finalizers) = self.finalizers.as_mut() else {
            return false;
        };
        let before = finalizers.len();
        finalizers.retain(|existing| existing != finalizer);
        let removed = finalizers.len() != before;
        if finalizers.is_empty() {
            self.finalizers = None;
        }
        removed
    }
}
