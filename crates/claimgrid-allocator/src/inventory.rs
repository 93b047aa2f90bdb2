//! Per-node device inventory.
//!
//! Bridges `claimgrid_state::ResourceSlice` to the flat, ordered device
//! list the allocator searches. Slices are visited sorted by
//! `(driver, pool, name)` and devices in their published order, so the
//! search order does not depend on how the store lists slices. A device
//! published by several slices appears once, from the first slice.

use std::collections::{BTreeMap, HashSet};

use claimgrid_state::{AttributeValue, DeviceId, ResourceSlice};

use crate::predicate::DeviceView;

/// One device reachable from a node.
#[derive(Debug, Clone)]
pub struct InventoryDevice<'a> {
    pub id: DeviceId,
    pub driver: &'a str,
    pub attributes: &'a BTreeMap<String, AttributeValue>,
    /// Attached to the node rather than reachable cluster-wide.
    pub node_local: bool,
}

impl InventoryDevice<'_> {
    pub fn view(&self) -> DeviceView<'_> {
        DeviceView {
            driver: self.driver,
            attributes: self.attributes,
        }
    }
}

/// All devices reachable from one node, in stable search order.
#[derive(Debug, Clone)]
pub struct NodeInventory<'a> {
    pub node_name: String,
    pub devices: Vec<InventoryDevice<'a>>,
}

impl<'a> NodeInventory<'a> {
    /// Collect the devices of every slice available on `node_name`.
    pub fn for_node(node_name: &str, slices: &'a [ResourceSlice]) -> Self {
        let mut available: Vec<&ResourceSlice> = slices
            .iter()
            .filter(|s| s.is_available_on(node_name))
            .collect();
        available.sort_by(|a, b| {
            (&a.driver, &a.pool, &a.meta.name).cmp(&(&b.driver, &b.pool, &b.meta.name))
        });

        let mut seen = HashSet::new();
        let devices = available
            .into_iter()
            .flat_map(|slice| {
                slice.devices.iter().map(move |device| InventoryDevice {
                    id: DeviceId::new(&slice.driver, &slice.pool, &device.name),
                    driver: &slice.driver,
                    attributes: &device.attributes,
                    node_local: !slice.all_nodes,
                })
            })
            .filter(|device| seen.insert(device.id.clone()))
            .collect();

        Self {
            node_name: node_name.to_string(),
            devices,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_slice(
        node: Option<&str>,
        driver: &str,
        pool: &str,
        devices: &[&str],
    ) -> ResourceSlice {
        let mut slice = ResourceSlice::for_node(node.unwrap_or("shared"), driver);
        slice.pool = pool.to_string();
        slice.meta.name = format!("{pool}-{driver}");
        slice.node_name = node.map(str::to_string);
        slice.all_nodes = node.is_none();
        for name in devices {
            slice = slice.with_device(name, &[]);
        }
        slice
    }

    #[test]
    fn collects_local_and_shared_devices() {
        let slices = vec![
            make_slice(Some("worker"), "gpu.example.com", "worker", &["gpu-0", "gpu-1"]),
            make_slice(Some("worker-2"), "gpu.example.com", "worker-2", &["gpu-0"]),
            make_slice(None, "net.example.com", "fabric", &["nic-0"]),
        ];
        let inventory = NodeInventory::for_node("worker", &slices);

        let ids: Vec<String> = inventory.devices.iter().map(|d| d.id.to_string()).collect();
        assert_eq!(
            ids,
            vec![
                "gpu.example.com/worker/gpu-0",
                "gpu.example.com/worker/gpu-1",
                "net.example.com/fabric/nic-0",
            ]
        );
        assert!(inventory.devices[0].node_local);
        assert!(!inventory.devices[2].node_local);
    }

    #[test]
    fn order_is_independent_of_listing_order() {
        let a = make_slice(Some("worker"), "b.example.com", "worker", &["d0"]);
        let b = make_slice(Some("worker"), "a.example.com", "worker", &["d0"]);
        let forward = vec![a.clone(), b.clone()];
        let backward = vec![b, a];

        let first: Vec<DeviceId> = NodeInventory::for_node("worker", &forward)
            .devices
            .into_iter()
            .map(|d| d.id)
            .collect();
        let second: Vec<DeviceId> = NodeInventory::for_node("worker", &backward)
            .devices
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(first, second);
        assert_eq!(first[0].driver, "a.example.com");
    }

    #[test]
    fn duplicate_devices_are_listed_once() {
        let first = make_slice(Some("worker"), "gpu.example.com", "worker", &["gpu-0", "gpu-1"]);
        let mut second = make_slice(Some("worker"), "gpu.example.com", "worker", &["gpu-0"]);
        second.meta.name = "worker-gpu.example.com-extra".to_string();
        let slices = vec![second, first];

        let ids: Vec<String> = NodeInventory::for_node("worker", &slices)
            .devices
            .iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["gpu.example.com/worker/gpu-0", "gpu.example.com/worker/gpu-1"]
        );
    }

    #[test]
    fn node_without_slices_is_empty() {
        let slices = vec![make_slice(Some("worker"), "gpu.example.com", "worker", &["gpu-0"])];
        assert!(NodeInventory::for_node("worker-3", &slices).is_empty());
    }
}
