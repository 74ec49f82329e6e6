//! Configuration for the scaler.
//!
//! Everything comes from `VMSCALER_*` environment variables. Values may be
//! wrapped in single or double quotes, which are stripped.

use std::fmt;

use anyhow::{bail, Context, Result};
use fleetscale_reconcile::{
    PlannerConfig, DEFAULT_VMS_PER_SCALE_SET, MAX_VMS_PER_SCALE_SET, MIN_VMS_PER_SCALE_SET,
};
use regex::Regex;

use crate::cloud::{subnet_id, EvictionPolicy, Priority, ScaleSetTemplate};

const ENV_PREFIX: &str = "VMSCALER_";

/// Storage queue naming rules: 3-63 lowercase alphanumerics or dashes, no
/// leading or trailing dash.
const QUEUE_NAME_PATTERN: &str = r"^[a-z0-9][a-z0-9-]{1,61}[a-z0-9]$";

/// Scaler configuration.
#[derive(Clone)]
pub struct Config {
    pub subscription_id: String,

    /// Resource group holding the scale sets and the demand tag.
    pub resource_group: String,

    pub location: String,
    pub image_id: String,
    pub vm_sku: String,

    /// Instances per scale set.
    pub vms_per_scale_set: u64,

    pub admin_username: String,
    pub admin_password: String,

    /// Network the new instances join.
    pub vnet_resource_group: String,
    pub vnet_name: String,
    pub subnet_name: String,

    pub single_placement_group: bool,
    pub overprovision: bool,
    pub priority: Priority,

    /// What happens to evicted low-priority instances.
    pub eviction_policy: EvictionPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Eviction queue name, derived from subscription and resource group.
    pub queue_name: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("subscription_id", &self.subscription_id)
            .field("resource_group", &self.resource_group)
            .field("location", &self.location)
            .field("image_id", &self.image_id)
            .field("vm_sku", &self.vm_sku)
            .field("vms_per_scale_set", &self.vms_per_scale_set)
            .field("admin_username", &self.admin_username)
            .field("admin_password", &"<redacted>")
            .field("vnet_resource_group", &self.vnet_resource_group)
            .field("vnet_name", &self.vnet_name)
            .field("subnet_name", &self.subnet_name)
            .field("single_placement_group", &self.single_placement_group)
            .field("overprovision", &self.overprovision)
            .field("priority", &self.priority)
            .field("eviction_policy", &self.eviction_policy)
            .field("log_level", &self.log_level)
            .field("queue_name", &self.queue_name)
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which receives the full variable
    /// name (including the `VMSCALER_` prefix).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| -> Option<String> {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| trim_quotes(&v).to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |name: &str| -> Result<String> {
            get(name).with_context(|| format!("{ENV_PREFIX}{name} is not set"))
        };
        let flag = |name: &str| -> Result<bool> {
            match get(name) {
                None => Ok(false),
                Some(v) => parse_bool(&v).with_context(|| format!("{ENV_PREFIX}{name}")),
            }
        };

        let subscription_id = required("SUBSCRIPTION_ID")?;
        let resource_group = required("RESOURCE_GROUP")?;

        let vms_per_scale_set = match get("VMS_PER_SCALE_SET") {
            None => DEFAULT_VMS_PER_SCALE_SET,
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("{ENV_PREFIX}VMS_PER_SCALE_SET: '{v}' is not a number"))?,
        };
        if !(MIN_VMS_PER_SCALE_SET..=MAX_VMS_PER_SCALE_SET).contains(&vms_per_scale_set) {
            bail!(
                "{ENV_PREFIX}VMS_PER_SCALE_SET must be between {MIN_VMS_PER_SCALE_SET} and {MAX_VMS_PER_SCALE_SET}, got {vms_per_scale_set}"
            );
        }

        let eviction_policy = match get("EVICTION_POLICY") {
            None => EvictionPolicy::Delete,
            Some(v) => EvictionPolicy::parse(&v).with_context(|| {
                format!("{ENV_PREFIX}EVICTION_POLICY: '{v}' is not delete or deallocate")
            })?,
        };

        let queue_name = queue_name(&subscription_id, &resource_group)?;

        Ok(Self {
            location: get("LOCATION").unwrap_or_else(|| "westus2".to_string()),
            image_id: required("IMAGE_ID")?,
            vm_sku: get("VM_SKU").unwrap_or_else(|| "Standard_DS14_v2".to_string()),
            vms_per_scale_set,
            admin_username: required("USERNAME")?,
            admin_password: required("PASSWORD")?,
            vnet_resource_group: required("VNET_RESOURCE_GROUP")?,
            vnet_name: required("VNET_NAME")?,
            subnet_name: required("SUBNET_NAME")?,
            single_placement_group: flag("SINGLE_PLACEMENT_GROUP")?,
            overprovision: flag("OVERPROVISION")?,
            priority: get("PRIORITY").map_or(Priority::Low, |v| Priority::parse(&v)),
            eviction_policy,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            subscription_id,
            resource_group,
            queue_name,
        })
    }

    /// Planner settings derived from this configuration.
    pub fn planner(&self) -> PlannerConfig {
        PlannerConfig {
            vms_per_scale_set: self.vms_per_scale_set,
            ..PlannerConfig::default()
        }
    }

    /// Template every new scale set is created from.
    pub fn template(&self) -> ScaleSetTemplate {
        ScaleSetTemplate {
            location: self.location.clone(),
            sku: self.vm_sku.clone(),
            capacity: self.vms_per_scale_set,
            image_id: self.image_id.clone(),
            admin_username: self.admin_username.clone(),
            admin_password: self.admin_password.clone(),
            subnet_id: subnet_id(
                &self.subscription_id,
                &self.vnet_resource_group,
                &self.vnet_name,
                &self.subnet_name,
            ),
            priority: self.priority,
            eviction_policy: self.eviction_policy,
            overprovision: self.overprovision,
            single_placement_group: self.single_placement_group,
        }
    }
}

/// Strip one layer of matching quotes.
fn trim_quotes(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("'{other}' is not a boolean"),
    }
}

/// Eviction queue name for a subscription and resource group.
pub fn queue_name(subscription_id: &str, resource_group: &str) -> Result<String> {
    let pattern = Regex::new(QUEUE_NAME_PATTERN).context("invalid queue name pattern")?;
    let name = format!("vmscaler-{subscription_id}-{resource_group}").to_lowercase();
    if !pattern.is_match(&name) {
        bail!("derived queue name '{name}' is not a valid queue name");
    }
    Ok(name)
}
