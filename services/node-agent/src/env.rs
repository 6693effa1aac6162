//! Container environment resolution.
//!
//! Providers never see `envFrom` or `valueFrom`: before a pod is created or
//! updated, every reference is replaced by a literal value and the service
//! variables a kubelet injects are appended. A missing reference that is not
//! optional fails with `InvalidInput`; an optional one is skipped and
//! reported as a warning.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ConfigMap, Container, EnvFromSource, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, Secret,
    Service,
};
use tracing::debug;
use vk_errdefs::{Error, ErrorKind, Result};

use crate::control_plane::ControlPlane;
use crate::workload::WorkloadKey;

pub const REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND: &str = "OptionalConfigMapNotFound";
pub const REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND: &str = "OptionalConfigMapKeyNotFound";
pub const REASON_OPTIONAL_SECRET_NOT_FOUND: &str = "OptionalSecretNotFound";
pub const REASON_OPTIONAL_SECRET_KEY_NOT_FOUND: &str = "OptionalSecretKeyNotFound";
pub const REASON_INVALID_ENV_NAMES: &str = "InvalidEnvironmentVariableNames";

/// Service whose variables every pod gets, by namespace and name.
const MASTER_SERVICE: (&str, &str) = ("default", "kubernetes");

/// Something skipped during resolution, worth an event on the pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub reason: &'static str,
    pub message: String,
}

/// A pod whose containers carry only literal environment values.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub pod: Pod,
    pub warnings: Vec<Warning>,
}

/// Resolves container environments against the control plane.
#[derive(Clone)]
pub struct EnvResolver {
    control_plane: Arc<dyn ControlPlane>,
}

impl EnvResolver {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Resolve every container and init container of a copy of `pod`.
    pub async fn resolve(&self, pod: &Pod) -> Result<Resolved> {
        let key = WorkloadKey::of(pod);
        let mut resolved = pod.clone();
        let mut sources = Sources::new(self.control_plane.as_ref(), &key.namespace);

        let services = self
            .service_env(pod, &key.namespace)
            .await
            .map_err(|e| Error::wrap(e, format!("resolve environment of {key}")))?;

        if let Some(spec) = resolved.spec.as_mut() {
            let containers = spec
                .init_containers
                .iter_mut()
                .flatten()
                .chain(spec.containers.iter_mut());
            for container in containers {
                resolve_container(pod, container, &mut sources, &services)
                    .await
                    .map_err(|e| Error::wrap(e, format!("resolve environment of {key}")))?;
            }
        }

        Ok(Resolved {
            pod: resolved,
            warnings: sources.warnings,
        })
    }

    /// Variables for the master service and, when service links are on,
    /// for every service in the pod's namespace.
    async fn service_env(&self, pod: &Pod, namespace: &str) -> Result<Vec<(String, String)>> {
        let links = pod
            .spec
            .as_ref()
            .and_then(|s| s.enable_service_links)
            .unwrap_or(true);
        let (master_namespace, master_name) = MASTER_SERVICE;

        let mut selected: BTreeMap<String, Service> = BTreeMap::new();
        if links {
            for service in self.control_plane.list_services(namespace).await? {
                if let Some(name) = service.metadata.name.clone() {
                    selected.insert(name, service);
                }
            }
        }
        if namespace != master_namespace || !links {
            let master = self
                .control_plane
                .list_services(master_namespace)
                .await?
                .into_iter()
                .find(|s| s.metadata.name.as_deref() == Some(master_name));
            if let Some(master) = master {
                selected.insert(master_name.to_string(), master);
            }
        }

        Ok(selected.values().flat_map(service_vars).collect())
    }
}

/// Config maps and secrets read during one resolution. `None` records a
/// lookup that found nothing.
struct Sources<'a> {
    control_plane: &'a dyn ControlPlane,
    namespace: &'a str,
    config_maps: HashMap<String, Option<ConfigMap>>,
    secrets: HashMap<String, Option<Secret>>,
    warnings: Vec<Warning>,
}

impl<'a> Sources<'a> {
    fn new(control_plane: &'a dyn ControlPlane, namespace: &'a str) -> Self {
        Self {
            control_plane,
            namespace,
            config_maps: HashMap::new(),
            secrets: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    async fn config_map(&mut self, name: &str) -> Result<Option<&ConfigMap>> {
        if !self.config_maps.contains_key(name) {
            let fetched = match self.control_plane.get_config_map(self.namespace, name).await {
                Ok(config_map) => Some(config_map),
                Err(e) if e.is(ErrorKind::NotFound) => None,
                Err(e) => return Err(Error::wrap(e, format!("read configmap {name:?}"))),
            };
            self.config_maps.insert(name.to_string(), fetched);
        }
        Ok(self.config_maps.get(name).and_then(Option::as_ref))
    }

    async fn secret(&mut self, name: &str) -> Result<Option<&Secret>> {
        if !self.secrets.contains_key(name) {
            let fetched = match self.control_plane.get_secret(self.namespace, name).await {
                Ok(secret) => Some(secret),
                Err(e) if e.is(ErrorKind::NotFound) => None,
                Err(e) => return Err(Error::wrap(e, format!("read secret {name:?}"))),
            };
            self.secrets.insert(name.to_string(), fetched);
        }
        Ok(self.secrets.get(name).and_then(Option::as_ref))
    }

    fn warn(&mut self, reason: &'static str, message: String) {
        self.warnings.push(Warning { reason, message });
    }
}

/// Environment under construction; later writes replace earlier ones in place.
#[derive(Default)]
struct Env {
    vars: Vec<(String, Option<String>)>,
    index: HashMap<String, usize>,
}

impl Env {
    fn set(&mut self, name: String, value: Option<String>) {
        match self.index.get(&name) {
            Some(&at) => self.vars[at].1 = value,
            None => {
                self.index.insert(name.clone(), self.vars.len());
                self.vars.push((name, value));
            }
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        let &at = self.index.get(name)?;
        self.vars[at].1.as_deref()
    }

    fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

async fn resolve_container(
    pod: &Pod,
    container: &mut Container,
    sources: &mut Sources<'_>,
    services: &[(String, String)],
) -> Result<()> {
    let mut env = Env::default();

    for from in container.env_from.iter().flatten() {
        env_from(from, &mut env, sources).await?;
    }

    for var in container.env.iter().flatten() {
        let value = match &var.value_from {
            Some(source) => match value_from(pod, var, source, sources).await? {
                Some(value) => Some(value),
                None => continue,
            },
            None => var
                .value
                .as_deref()
                .map(|value| expand(value, |name| env.get(name).or_else(|| lookup(services, name)))),
        };
        env.set(var.name.clone(), value);
    }

    for (name, value) in services {
        if !env.contains(name) {
            env.set(name.clone(), Some(value.clone()));
        }
    }

    container.env_from = None;
    if !env.vars.is_empty() {
        container.env = Some(
            env.vars
                .into_iter()
                .map(|(name, value)| EnvVar {
                    name,
                    value,
                    value_from: None,
                })
                .collect(),
        );
    }
    Ok(())
}

/// Value of one `valueFrom` variable; `None` skips the variable.
async fn value_from(
    pod: &Pod,
    var: &EnvVar,
    source: &EnvVarSource,
    sources: &mut Sources<'_>,
) -> Result<Option<String>> {
    if let Some(selector) = &source.config_map_key_ref {
        let optional = selector.optional.unwrap_or(false);
        let found = sources
            .config_map(&selector.name)
            .await?
            .map(|m| m.data.as_ref().and_then(|d| d.get(&selector.key)).cloned());
        return match found {
            Some(Some(value)) => Ok(Some(value)),
            None if optional => {
                sources.warn(
                    REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND,
                    format!(
                        "skipping optional envvar {:?}: configmap {:?} not found",
                        var.name, selector.name
                    ),
                );
                Ok(None)
            }
            Some(None) if optional => {
                sources.warn(
                    REASON_OPTIONAL_CONFIG_MAP_KEY_NOT_FOUND,
                    format!(
                        "skipping optional envvar {:?}: key {:?} does not exist in configmap {:?}",
                        var.name, selector.key, selector.name
                    ),
                );
                Ok(None)
            }
            None => Err(Error::invalid_input(format!(
                "configmap {:?} not found",
                selector.name
            ))),
            Some(None) => Err(Error::invalid_input(format!(
                "configmap {:?} does not contain key {:?}",
                selector.name, selector.key
            ))),
        };
    }

    if let Some(selector) = &source.secret_key_ref {
        let optional = selector.optional.unwrap_or(false);
        let found = sources
            .secret(&selector.name)
            .await?
            .map(|secret| secret_value(secret, &selector.key));
        return match found {
            Some(Some(value)) => Ok(Some(value)),
            None if optional => {
                sources.warn(
                    REASON_OPTIONAL_SECRET_NOT_FOUND,
                    format!(
                        "skipping optional envvar {:?}: secret {:?} not found",
                        var.name, selector.name
                    ),
                );
                Ok(None)
            }
            Some(None) if optional => {
                sources.warn(
                    REASON_OPTIONAL_SECRET_KEY_NOT_FOUND,
                    format!(
                        "skipping optional envvar {:?}: key {:?} does not exist in secret {:?}",
                        var.name, selector.key, selector.name
                    ),
                );
                Ok(None)
            }
            None => Err(Error::invalid_input(format!(
                "secret {:?} not found",
                selector.name
            ))),
            Some(None) => Err(Error::invalid_input(format!(
                "secret {:?} does not contain key {:?}",
                selector.name, selector.key
            ))),
        };
    }

    if let Some(selector) = &source.field_ref {
        return field_value(pod, selector).map(Some);
    }

    debug!(name = %var.name, "Dropping resource field reference");
    Ok(None)
}

async fn env_from(from: &EnvFromSource, env: &mut Env, sources: &mut Sources<'_>) -> Result<()> {
    let (kind, name, optional, data) = if let Some(reference) = &from.config_map_ref {
        let data = sources
            .config_map(&reference.name)
            .await?
            .map(|m| m.data.clone().unwrap_or_default());
        ("configmap", &reference.name, reference.optional, data)
    } else if let Some(reference) = &from.secret_ref {
        let data = sources.secret(&reference.name).await?.map(secret_data);
        ("secret", &reference.name, reference.optional, data)
    } else {
        return Ok(());
    };

    let Some(data) = data else {
        if optional.unwrap_or(false) {
            let reason = if kind == "secret" {
                REASON_OPTIONAL_SECRET_NOT_FOUND
            } else {
                REASON_OPTIONAL_CONFIG_MAP_NOT_FOUND
            };
            sources.warn(reason, format!("{kind} {name:?} not found"));
            return Ok(());
        }
        return Err(Error::invalid_input(format!("{kind} {name:?} not found")));
    };

    let prefix = from.prefix.as_deref().unwrap_or("");
    let mut invalid = Vec::new();
    for (key, value) in data {
        let key = format!("{prefix}{key}");
        if is_env_var_name(&key) {
            env.set(key, Some(value));
        } else {
            invalid.push(key);
        }
    }
    if !invalid.is_empty() {
        let namespace = sources.namespace;
        sources.warn(
            REASON_INVALID_ENV_NAMES,
            format!(
                "keys [{}] from {kind} {namespace}/{name} were skipped since they are invalid as environment variable names",
                invalid.join(", ")
            ),
        );
    }
    Ok(())
}

fn secret_data(secret: &Secret) -> BTreeMap<String, String> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(key, value)| (key.clone(), String::from_utf8_lossy(&value.0).into_owned()))
        .collect()
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    let value = secret.data.as_ref()?.get(key)?;
    Some(String::from_utf8_lossy(&value.0).into_owned())
}

/// Downward API values a pod may reference from its environment.
fn field_value(pod: &Pod, selector: &ObjectFieldSelector) -> Result<String> {
    if let Some(version) = selector.api_version.as_deref() {
        if version != "v1" {
            return Err(Error::invalid_input(format!(
                "unsupported field reference version {version:?}"
            )));
        }
    }

    let path = selector.field_path.as_str();
    let meta = &pod.metadata;
    let spec = pod.spec.as_ref();
    let status = pod.status.as_ref();
    let value = match path {
        "metadata.name" => meta.name.clone(),
        "metadata.namespace" => meta.namespace.clone(),
        "metadata.uid" => meta.uid.clone(),
        "spec.nodeName" => spec.and_then(|s| s.node_name.clone()),
        "spec.serviceAccountName" => spec.and_then(|s| s.service_account_name.clone()),
        "status.podIP" => status.and_then(|s| s.pod_ip.clone()),
        "status.hostIP" => status.and_then(|s| s.host_ip.clone()),
        _ => {
            let (map, key) = subscript(path, "metadata.labels")
                .map(|key| (meta.labels.as_ref(), key))
                .or_else(|| {
                    subscript(path, "metadata.annotations").map(|key| (meta.annotations.as_ref(), key))
                })
                .ok_or_else(|| {
                    Error::invalid_input(format!("unsupported field reference {path:?}"))
                })?;
            map.and_then(|m| m.get(key)).cloned()
        }
    };
    Ok(value.unwrap_or_default())
}

/// The key of `field['key']`.
fn subscript<'a>(path: &'a str, field: &str) -> Option<&'a str> {
    path.strip_prefix(field)?
        .strip_prefix("['")?
        .strip_suffix("']")
}

/// Variables for one service, named the way a kubelet names them.
fn service_vars(service: &Service) -> Vec<(String, String)> {
    let Some(spec) = &service.spec else {
        return Vec::new();
    };
    let ip = match spec.cluster_ip.as_deref() {
        Some(ip) if !ip.is_empty() && ip != "None" => ip,
        _ => return Vec::new(),
    };
    let prefix = env_name(service.metadata.name.as_deref().unwrap_or_default());
    let ports = spec.ports.as_deref().unwrap_or_default();

    let mut vars = vec![(format!("{prefix}_SERVICE_HOST"), ip.to_string())];
    if let Some(first) = ports.first() {
        vars.push((format!("{prefix}_SERVICE_PORT"), first.port.to_string()));
    }
    for port in ports {
        if let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) {
            vars.push((
                format!("{prefix}_SERVICE_PORT_{}", env_name(name)),
                port.port.to_string(),
            ));
        }
    }

    for (i, port) in ports.iter().enumerate() {
        let protocol = port.protocol.as_deref().unwrap_or("TCP");
        let lower = protocol.to_ascii_lowercase();
        let host_port = if ip.contains(':') {
            format!("[{ip}]:{}", port.port)
        } else {
            format!("{ip}:{}", port.port)
        };
        let url = format!("{lower}://{host_port}");
        if i == 0 {
            vars.push((format!("{prefix}_PORT"), url.clone()));
        }
        let port_prefix = format!("{prefix}_PORT_{}_{}", port.port, protocol.to_ascii_uppercase());
        vars.push((format!("{port_prefix}_PROTO"), lower));
        vars.push((format!("{port_prefix}_PORT"), port.port.to_string()));
        vars.push((format!("{port_prefix}_ADDR"), ip.to_string()));
        vars.push((port_prefix, url));
    }
    vars
}

fn env_name(name: &str) -> String {
    name.to_ascii_uppercase().replace('-', "_")
}

fn lookup<'a>(vars: &'a [(String, String)], name: &str) -> Option<&'a str> {
    vars.iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn is_env_var_name(name: &str) -> bool {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_');
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if allowed(c) && !c.is_ascii_digit()) && chars.all(allowed)
}

/// Expand `$(NAME)` references. `$$` escapes a dollar; unknown names and
/// unterminated references are kept verbatim.
fn expand<'a>(input: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('(') {
            let Some(end) = body.find(')') else {
                out.push_str(&rest[at..]);
                rest = "";
                break;
            };
            let name = &body[..end];
            match lookup(name) {
                Some(value) => out.push_str(value),
                None => {
                    out.push_str("$(");
                    out.push_str(name);
                    out.push(')');
                }
            }
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}
