//! In-process gateway simulation.
//!
//! Behaves like a WANIPConnection service: one table keyed by
//! (external port, protocol), fault 714 on deleting an unknown entry, fault
//! 713 past the end of the table and fault 718 when a port is already
//! forwarded to another client. Used by `igdctl --simulate` and by tests,
//! which can also inject faults and inspect the call log.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::error::{ActionError, ProtocolFault, TransportError, UpnpErrorCode};
use super::soap::{AddPortMappingRequest, GenericPortMappingEntry, IgdControl};
use super::Protocol;

#[derive(Default)]
struct State {
    external_ip: Option<IpAddr>,
    table: Vec<GenericPortMappingEntry>,
    calls: Vec<String>,
    add_faults: HashMap<u16, u16>,
    delete_faults: HashMap<u16, u16>,
    fail_external_ip: bool,
    endless_table: bool,
    hang: Option<Duration>,
}

/// A simulated IGD mapping table
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new(external_ip: IpAddr) -> Self {
        Self {
            state: Mutex::new(State {
                external_ip: Some(external_ip),
                ..State::default()
            }),
        }
    }

    pub fn set_external_ip(&self, ip: IpAddr) {
        self.state.lock().external_ip = Some(ip);
    }

    /// Make `GetExternalIPAddress` fail with a transport error
    pub fn fail_external_ip(&self, fail: bool) {
        self.state.lock().fail_external_ip = fail;
    }

    /// Reject `AddPortMapping` for `external_port` with fault `code`
    pub fn fail_add(&self, external_port: u16, code: u16) {
        self.state.lock().add_faults.insert(external_port, code);
    }

    /// Reject `DeletePortMapping` for `external_port` with fault `code`
    pub fn fail_delete(&self, external_port: u16, code: u16) {
        self.state.lock().delete_faults.insert(external_port, code);
    }

    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.add_faults.clear();
        state.delete_faults.clear();
    }

    /// Never report the end of the table; indexes past the real entries yield
    /// synthetic ones.
    pub fn never_end_enumeration(&self, endless: bool) {
        self.state.lock().endless_table = endless;
    }

    /// Delay every action by `delay` before answering
    pub fn hang_actions(&self, delay: Option<Duration>) {
        self.state.lock().hang = delay;
    }

    pub fn set_enabled(&self, external_port: u16, protocol: Protocol, enabled: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state
            .table
            .iter_mut()
            .find(|e| e.external_port == external_port && e.protocol == protocol.as_str())
        {
            entry.enabled = enabled;
        }
    }

    /// Insert an entry directly, as if another party had created it
    pub fn insert_entry(&self, entry: GenericPortMappingEntry) {
        self.state.lock().table.push(entry);
    }

    /// Current table contents in device order
    pub fn table(&self) -> Vec<GenericPortMappingEntry> {
        self.state.lock().table.clone()
    }

    pub fn contains(&self, external_port: u16, protocol: Protocol) -> bool {
        self.state
            .lock()
            .table
            .iter()
            .any(|e| e.external_port == external_port && e.protocol == protocol.as_str())
    }

    /// Every action received so far, e.g. `AddPortMapping 80/TCP`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    async fn enter(&self, call: String) {
        let hang = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.hang
        };
        if let Some(delay) = hang {
            tokio::time::sleep(delay).await;
        }
    }
}

fn fault(code: UpnpErrorCode) -> ActionError {
    ProtocolFault::new(code.code(), code.to_string()).into()
}

#[async_trait]
impl IgdControl for MemoryGateway {
    async fn get_external_ip_address(&self) -> Result<String, ActionError> {
        self.enter("GetExternalIPAddress".to_string()).await;

        let state = self.state.lock();
        if state.fail_external_ip {
            return Err(TransportError::Http {
                url: "memory://gateway".to_string(),
                reason: "connection refused".to_string(),
            }
            .into());
        }
        Ok(state.external_ip.map(|ip| ip.to_string()).unwrap_or_default())
    }

    async fn add_port_mapping(&self, request: &AddPortMappingRequest) -> Result<(), ActionError> {
        self.enter(format!("AddPortMapping {}/{}", request.external_port, request.protocol))
            .await;

        let mut state = self.state.lock();
        if let Some(code) = state.add_faults.get(&request.external_port) {
            return Err(ProtocolFault::new(*code, "injected fault").into());
        }

        let protocol = request.protocol.as_str();
        let entry = GenericPortMappingEntry {
            remote_host: String::new(),
            external_port: request.external_port,
            protocol: protocol.to_string(),
            internal_port: request.internal_port,
            internal_client: request.internal_client.clone(),
            enabled: request.enabled,
            description: request.description.clone(),
            lease_duration: request.lease_duration,
        };

        match state
            .table
            .iter_mut()
            .find(|e| e.external_port == request.external_port && e.protocol == protocol)
        {
            Some(existing) if existing.internal_client != request.internal_client => {
                Err(fault(UpnpErrorCode::ConflictInMappingEntry))
            }
            Some(existing) => {
                *existing = entry;
                Ok(())
            }
            None => {
                state.table.push(entry);
                Ok(())
            }
        }
    }

    async fn delete_port_mapping(&self, external_port: u16, protocol: Protocol) -> Result<(), ActionError> {
        self.enter(format!("DeletePortMapping {external_port}/{protocol}")).await;

        let mut state = self.state.lock();
        if let Some(code) = state.delete_faults.get(&external_port) {
            return Err(ProtocolFault::new(*code, "injected fault").into());
        }

        let before = state.table.len();
        state
            .table
            .retain(|e| !(e.external_port == external_port && e.protocol == protocol.as_str()));
        if state.table.len() == before {
            return Err(fault(UpnpErrorCode::NoSuchEntryInArray));
        }
        Ok(())
    }

    async fn get_generic_port_mapping_entry(&self, index: u16) -> Result<GenericPortMappingEntry, ActionError> {
        self.enter(format!("GetGenericPortMappingEntry {index}")).await;

        let state = self.state.lock();
        if let Some(entry) = state.table.get(usize::from(index)) {
            return Ok(entry.clone());
        }
        if state.endless_table {
            return Ok(GenericPortMappingEntry {
                remote_host: String::new(),
                external_port: 10000u16.wrapping_add(index),
                protocol: "TCP".to_string(),
                internal_port: 10000u16.wrapping_add(index),
                internal_client: "192.168.1.2".to_string(),
                enabled: true,
                description: "synthetic".to_string(),
                lease_duration: 0,
            });
        }
        Err(fault(UpnpErrorCode::SpecifiedArrayIndexInvalid))
    }
}
