//! Domain types for the ClaimGrid object store.
//!
//! These types represent the objects the claim-allocation coordinator
//! reads and writes: resource claims, device classes, per-node device
//! inventories (resource slices), control-plane contexts, plus the
//! workloads and nodes that are handed to it by the host. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::version::ResourceVersion;
use crate::watch::WatchedObject;

/// Unique identifier assigned by the store on create.
pub type Uid = String;

/// Owner kind used for references to workloads.
pub const WORKLOAD_KIND: &str = "Workload";

/// Consumer resource name used in `reserved_for` entries.
pub const WORKLOAD_RESOURCE: &str = "workloads";

/// Field key accepted in node selector `match_fields`.
pub const NODE_NAME_FIELD: &str = "metadata.name";

// ── Identity ──────────────────────────────────────────────────────

/// Identity of an object, rendered as `{namespace}/{name}`.
///
/// Cluster-scoped objects have an empty namespace and render as `{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self::new("", name)
    }

    /// Build the key for the object's table.
    pub fn table_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Kinds of objects held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    ResourceClaim,
    DeviceClass,
    ResourceSlice,
    ControlPlaneContext,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::ResourceClaim => "resourceclaim",
            ObjectKind::DeviceClass => "deviceclass",
            ObjectKind::ResourceSlice => "resourceslice",
            ObjectKind::ControlPlaneContext => "controlplanecontext",
        };
        f.write_str(name)
    }
}

/// Metadata common to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// Assigned by the store on create.
    #[serde(default)]
    pub uid: Uid,
    /// Assigned by the store on every write.
    #[serde(default)]
    pub version: ResourceVersion,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    /// Set once deletion has been requested; the object lingers while
    /// finalizers are present.
    #[serde(default)]
    pub deletion_requested: bool,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The owner reference marked as controller, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.owner_references.iter().find(|r| r.controller)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer if absent. Returns true if it was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }
}

/// Reference from an object to the object that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: Uid,
    #[serde(default)]
    pub controller: bool,
}

/// An object type that can be persisted in the store.
pub trait StoredObject: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Wrap into the change-notification variant for this kind.
    fn into_watched(self) -> WatchedObject;

    /// Borrow the object out of a notification of this kind.
    fn from_watched(obj: &WatchedObject) -> Option<&Self>;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

// ── Workload & Node ───────────────────────────────────────────────

/// The schedulable unit that references resource claims.
///
/// Workloads are owned by the host; the coordinator only reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub namespace: String,
    pub name: String,
    pub uid: Uid,
    /// Named claim slots, in declaration order.
    #[serde(default)]
    pub claims: Vec<WorkloadClaim>,
    /// Names of claims generated from templates, filled in by the
    /// template controller.
    #[serde(default)]
    pub claim_statuses: Vec<WorkloadClaimStatus>,
}

/// One named claim slot of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadClaim {
    pub name: String,
    pub source: ClaimSource,
}

/// Where a workload's claim comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaimSource {
    /// A pre-existing claim referenced by name.
    ClaimName { claim_name: String },
    /// A claim generated per workload from a template.
    Template { template_name: String },
}

/// Generated claim name for a template slot.
///
/// `claim_name == None` means the slot needs no claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadClaimStatus {
    pub name: String,
    #[serde(default)]
    pub claim_name: Option<String>,
}

impl Workload {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(&self.namespace, &self.name)
    }

    /// The `reserved_for` entry that represents this workload.
    pub fn as_consumer(&self) -> ConsumerReference {
        ConsumerReference {
            resource: WORKLOAD_RESOURCE.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    /// Controller owner reference pointing at this workload.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: WORKLOAD_KIND.to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: true,
        }
    }

    pub fn claim_status(&self, slot: &str) -> Option<&WorkloadClaimStatus> {
        self.claim_statuses.iter().find(|s| s.name == slot)
    }
}

/// A compute node as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// ── ResourceClaim ─────────────────────────────────────────────────

/// A request for allocatable devices with a lifecycle independent of
/// any single workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub meta: ObjectMeta,
    pub spec: ClaimSpec,
    #[serde(default)]
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimSpec {
    /// Name of the out-of-tree controller that allocates this claim.
    /// `None` means the scheduler allocates it from resource slices.
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub requests: Vec<DeviceRequest>,
}

/// One device request within a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub name: String,
    pub device_class_name: String,
    /// Predicate expressions every chosen device must satisfy.
    #[serde(default)]
    pub selectors: Vec<String>,
    /// Number of distinct devices needed.
    #[serde(default = "default_device_count")]
    pub count: u32,
}

fn default_device_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClaimStatus {
    #[serde(default)]
    pub allocation: Option<AllocationResult>,
    #[serde(default)]
    pub reserved_for: Vec<ConsumerReference>,
    #[serde(default)]
    pub deallocation_requested: bool,
}

/// A consumer entitled to use a claim's allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerReference {
    pub resource: String,
    pub name: String,
    pub uid: Uid,
}

/// The committed assignment of devices satisfying a claim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllocationResult {
    /// Set when a delegated controller produced this allocation.
    #[serde(default)]
    pub controller: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceAllocation>,
    /// Nodes on which the allocated devices are reachable. `None` means
    /// every node.
    #[serde(default)]
    pub node_selector: Option<NodeSelector>,
}

/// One device assigned to one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAllocation {
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,
}

impl DeviceAllocation {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(&self.driver, &self.pool, &self.device)
    }
}

/// Cluster-wide identity of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub driver: String,
    pub pool: String,
    pub device: String,
}

impl DeviceId {
    pub fn new(driver: &str, pool: &str, device: &str) -> Self {
        Self {
            driver: driver.to_string(),
            pool: pool.to_string(),
            device: device.to_string(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.driver, self.pool, self.device)
    }
}

impl ResourceClaim {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: ClaimSpec::default(),
            status: ClaimStatus::default(),
        }
    }

    /// Whether allocation is delegated to an out-of-tree controller.
    pub fn uses_control_plane(&self) -> bool {
        self.spec.controller.is_some()
    }

    pub fn is_allocated(&self) -> bool {
        self.status.allocation.is_some()
    }

    /// Allocated by the scheduler itself rather than a controller.
    pub fn is_allocated_with_structured_parameters(&self) -> bool {
        self.status
            .allocation
            .as_ref()
            .is_some_and(|a| a.controller.is_none())
    }

    pub fn is_reserved_for(&self, workload: &Workload) -> bool {
        self.status
            .reserved_for
            .iter()
            .any(|r| r.resource == WORKLOAD_RESOURCE && r.uid == workload.uid)
    }

    /// Whether another consumer can still be added to `reserved_for`.
    pub fn can_be_reserved(&self, max_reserved_for: usize) -> bool {
        self.status.reserved_for.len() < max_reserved_for
    }

    /// Devices referenced by the current allocation, if any.
    pub fn allocated_devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.status
            .allocation
            .iter()
            .flat_map(|a| a.devices.iter().map(DeviceAllocation::device_id))
    }
}

impl StoredObject for ResourceClaim {
    const KIND: ObjectKind = ObjectKind::ResourceClaim;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_watched(self) -> WatchedObject {
        WatchedObject::ResourceClaim(self)
    }

    fn from_watched(obj: &WatchedObject) -> Option<&Self> {
        match obj {
            WatchedObject::ResourceClaim(o) => Some(o),
            _ => None,
        }
    }
}

// ── Node selectors ────────────────────────────────────────────────

/// A boolean expression over node labels and fields.
///
/// Terms are ORed; the requirements inside one term are ANDed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSelector {
    pub terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSelectorTerm {
    /// Requirements on node labels.
    #[serde(default)]
    pub match_labels: Vec<NodeSelectorRequirement>,
    /// Requirements on node fields; only `metadata.name` is defined.
    #[serde(default)]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl NodeSelector {
    /// Selector that matches exactly the named node.
    pub fn for_node(node_name: &str) -> Self {
        Self {
            terms: vec![NodeSelectorTerm {
                match_labels: Vec::new(),
                match_fields: vec![NodeSelectorRequirement {
                    key: NODE_NAME_FIELD.to_string(),
                    operator: SelectorOperator::In,
                    values: vec![node_name.to_string()],
                }],
            }],
        }
    }

    /// Selector with a single label requirement `key In values`.
    pub fn label_in(key: &str, values: &[&str]) -> Self {
        Self {
            terms: vec![NodeSelectorTerm {
                match_labels: vec![NodeSelectorRequirement {
                    key: key.to_string(),
                    operator: SelectorOperator::In,
                    values: values.iter().map(|v| v.to_string()).collect(),
                }],
                match_fields: Vec::new(),
            }],
        }
    }
}

// ── DeviceClass ───────────────────────────────────────────────────

/// A named bundle of predicates applied to every request that uses it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceClass {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub selectors: Vec<String>,
}

impl DeviceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new("", name),
            selectors: Vec::new(),
        }
    }
}

impl StoredObject for DeviceClass {
    const KIND: ObjectKind = ObjectKind::DeviceClass;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_watched(self) -> WatchedObject {
        WatchedObject::DeviceClass(self)
    }

    fn from_watched(obj: &WatchedObject) -> Option<&Self> {
        match obj {
            WatchedObject::DeviceClass(o) => Some(o),
            _ => None,
        }
    }
}

// ── ResourceSlice ─────────────────────────────────────────────────

/// A pool of devices published by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlice {
    pub meta: ObjectMeta,
    pub driver: String,
    pub pool: String,
    /// Node the devices are attached to.
    #[serde(default)]
    pub node_name: Option<String>,
    /// Devices reachable from every node.
    #[serde(default)]
    pub all_nodes: bool,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A single device and its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,
}

/// Typed device attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    String(String),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl ResourceSlice {
    /// Slice of devices attached to `node_name`, named after the node.
    pub fn for_node(node_name: &str, driver: &str) -> Self {
        Self {
            meta: ObjectMeta::new("", format!("{node_name}-{driver}")),
            driver: driver.to_string(),
            pool: node_name.to_string(),
            node_name: Some(node_name.to_string()),
            all_nodes: false,
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, name: &str, attributes: &[(&str, AttributeValue)]) -> Self {
        self.devices.push(Device {
            name: name.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        });
        self
    }

    /// Whether the devices of this slice are reachable from `node_name`.
    pub fn is_available_on(&self, node_name: &str) -> bool {
        self.all_nodes || self.node_name.as_deref() == Some(node_name)
    }
}

impl StoredObject for ResourceSlice {
    const KIND: ObjectKind = ObjectKind::ResourceSlice;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_watched(self) -> WatchedObject {
        WatchedObject::ResourceSlice(self)
    }

    fn from_watched(obj: &WatchedObject) -> Option<&Self> {
        match obj {
            WatchedObject::ResourceSlice(o) => Some(o),
            _ => None,
        }
    }
}

// ── ControlPlaneContext ───────────────────────────────────────────

/// Shared negotiation object between the scheduler and delegated
/// allocation controllers, one per workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneContext {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: ContextSpec,
    #[serde(default)]
    pub status: ContextStatus,
}

/// Written by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextSpec {
    #[serde(default)]
    pub selected_node: Option<String>,
    #[serde(default)]
    pub potential_nodes: Vec<String>,
}

/// Written by the controllers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContextStatus {
    #[serde(default)]
    pub claims: Vec<ClaimSchedulingStatus>,
}

/// Controller feedback for one claim slot of the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimSchedulingStatus {
    /// Workload claim slot name.
    pub name: String,
    #[serde(default)]
    pub unsuitable_nodes: Vec<String>,
}

impl ControlPlaneContext {
    /// Empty context for a workload, named after it and owned by it.
    pub fn for_workload(workload: &Workload) -> Self {
        let mut meta = ObjectMeta::new(&workload.namespace, &workload.name);
        meta.owner_references.push(workload.owner_reference());
        Self {
            meta,
            spec: ContextSpec::default(),
            status: ContextStatus::default(),
        }
    }

    pub fn claim_status(&self, slot: &str) -> Option<&ClaimSchedulingStatus> {
        self.status.claims.iter().find(|s| s.name == slot)
    }

    pub fn lists_potential_node(&self, node_name: &str) -> bool {
        self.spec.potential_nodes.iter().any(|n| n == node_name)
    }
}

impl StoredObject for ControlPlaneContext {
    const KIND: ObjectKind = ObjectKind::ControlPlaneContext;

    fn meta(&self) -> &ObjectMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.meta
    }

    fn into_watched(self) -> WatchedObject {
        WatchedObject::ControlPlaneContext(self)
    }

    fn from_watched(obj: &WatchedObject) -> Option<&Self> {
        match obj {
            WatchedObject::ControlPlaneContext(o) => Some(o),
            _ => None,
        }
    }
}
