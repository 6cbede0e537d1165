use heap::{OldSpace, SemiSpace};
use object::{HeapObject, Value};

/// A process-owned communication endpoint. The `target` reference is weak:
/// ports never keep their referent alive, and the cleanup passes below
/// drop ports whose target a collection has just reclaimed.
#[derive(Debug)]
pub struct Port {
    pub id: u64,
    pub target: Value,
}

impl Port {
    pub fn new(id: u64, target: Value) -> Port {
        Port { id, target }
    }
}

/// Port cleanup after a new-space scavenge: targets left behind in
/// from-space are dead, forwarded targets are followed.
///
/// # Safety
///
/// `from` must be the space the scavenge just emptied, with forwarding
/// words still intact.
pub unsafe fn cleanup_ports_after_scavenge(
    from: *const SemiSpace,
    ports: Vec<Port>,
) -> Vec<Port> {
    let mut live = Vec::with_capacity(ports.len());
    for mut port in ports {
        if !port.target.is_heap_object() {
            live.push(port);
            continue;
        }
        let address = port.target.address();
        if !(*from).contains(address) {
            live.push(port);
            continue;
        }
        let object = HeapObject::at(address);
        if object.has_forwarding_address() {
            port.target = Value::from_address(object.forwarding_address());
            live.push(port);
        }
    }
    live
}

/// Port cleanup during an old-space cycle, with mark bits still valid and
/// (in a compacting cycle) the destination table computed but the objects
/// not yet moved.
///
/// # Safety
///
/// Must run between marking and the object moves of the current cycle.
pub unsafe fn cleanup_ports_after_mark(
    old: *const OldSpace,
    new_space: *const SemiSpace,
    ports: Vec<Port>,
) -> Vec<Port> {
    let mut live = Vec::with_capacity(ports.len());
    for mut port in ports {
        if !port.target.is_heap_object() {
            live.push(port);
            continue;
        }
        let address = port.target.address();
        if (*old).contains(address) {
            if !(*old).is_marked(address) {
                continue;
            }
            if let Some(new_address) = (*old).forwarding_address_of(address) {
                port.target = Value::from_address(new_address);
            }
            live.push(port);
        } else if (*new_space).contains(address) {
            if (*new_space).is_marked(address) {
                live.push(port);
            }
        } else {
            // Program-space targets are immortal as far as the shared
            // heap is concerned.
            live.push(port);
        }
    }
    live
}
