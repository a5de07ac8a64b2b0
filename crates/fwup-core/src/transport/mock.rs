//! Mock USB transport for testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{
    ControlRequest, DeviceDescription, DeviceFilter, TransportError, UsbBus, UsbTransport,
};

/// Direction of a logged control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDirection {
    In,
    Out,
}

/// One control transfer captured by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub direction: ControlDirection,
    pub request: ControlRequest,
    /// OUT payload; empty for IN transfers.
    pub data: Vec<u8>,
    /// Requested length for IN transfers.
    pub length: u16,
}

#[derive(Default)]
struct MockDeviceState {
    /// Queued IN responses, keyed by request number.
    in_queues: HashMap<u8, VecDeque<Result<Vec<u8>, TransportError>>>,
    /// Queued OUT results, keyed by request number. Empty means success.
    out_queues: HashMap<u8, VecDeque<Result<(), TransportError>>>,
    log: Vec<ControlRecord>,
    claimed: Option<u8>,
    configuration: Option<u8>,
    connected: bool,
}

/// Mock device for unit testing protocol engines.
///
/// Clones share state, so a test keeps one handle to script responses and
/// inspect the transfer log while the engine owns another.
#[derive(Clone)]
pub struct MockTransport {
    description: DeviceDescription,
    state: Arc<Mutex<MockDeviceState>>,
}

impl MockTransport {
    pub fn new(description: DeviceDescription) -> Self {
        Self {
            description,
            state: Arc::new(Mutex::new(MockDeviceState {
                connected: true,
                ..Default::default()
            })),
        }
    }

    /// Queue a response for the next IN transfer with this request number.
    pub fn queue_in(&self, request: u8, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .in_queues
            .entry(request)
            .or_default()
            .push_back(Ok(data.to_vec()));
    }

    /// Queue a failure for the next IN transfer with this request number.
    pub fn fail_in(&self, request: u8, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .in_queues
            .entry(request)
            .or_default()
            .push_back(Err(error));
    }

    /// Queue a failure for the next OUT transfer with this request number.
    pub fn fail_out(&self, request: u8, error: TransportError) {
        self.state
            .lock()
            .unwrap()
            .out_queues
            .entry(request)
            .or_default()
            .push_back(Err(error));
    }

    /// Get all captured control transfers.
    pub fn log(&self) -> Vec<ControlRecord> {
        self.state.lock().unwrap().log.clone()
    }

    /// Captured OUT transfers only.
    pub fn writes(&self) -> Vec<ControlRecord> {
        self.log()
            .into_iter()
            .filter(|r| r.direction == ControlDirection::Out)
            .collect()
    }

    pub fn claimed_interface(&self) -> Option<u8> {
        self.state.lock().unwrap().claimed
    }

    pub fn configuration(&self) -> Option<u8> {
        self.state.lock().unwrap().configuration
    }

    /// Simulate device disconnect.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }
}

impl UsbTransport for MockTransport {
    fn description(&self) -> &DeviceDescription {
        &self.description
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.state.lock().unwrap().claimed = Some(interface);
        Ok(())
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        self.state.lock().unwrap().configuration = Some(configuration);
        Ok(())
    }

    fn control_in(
        &self,
        request: ControlRequest,
        length: u16,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.log.push(ControlRecord {
            direction: ControlDirection::In,
            request,
            data: Vec::new(),
            length,
        });
        let mut data = state
            .in_queues
            .get_mut(&request.request)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Err(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }))?;
        data.truncate(length as usize);
        Ok(data)
    }

    fn control_out(
        &self,
        request: ControlRequest,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::Disconnected);
        }
        state.log.push(ControlRecord {
            direction: ControlDirection::Out,
            request,
            data: data.to_vec(),
            length: data.len() as u16,
        });
        state
            .out_queues
            .get_mut(&request.request)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[derive(Default)]
struct MockBusState {
    attached: Vec<MockTransport>,
    /// Results of upcoming enumerations, consulted before falling back to `attached`.
    scripted: VecDeque<Result<Vec<MockTransport>, TransportError>>,
    enumerations: usize,
    sleeps: Vec<Duration>,
}

/// Mock bus: hands out `MockTransport`s and records sleeps instead of sleeping.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockBusState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug a device in.
    pub fn attach(&self, device: MockTransport) {
        self.state.lock().unwrap().attached.push(device);
    }

    /// Make the next enumeration return exactly `devices`.
    pub fn script_enumeration(&self, devices: Vec<MockTransport>) {
        self.state.lock().unwrap().scripted.push_back(Ok(devices));
    }

    /// Make the next enumeration fail.
    pub fn fail_enumeration(&self, error: TransportError) {
        self.state.lock().unwrap().scripted.push_back(Err(error));
    }

    /// Number of enumerations performed so far.
    pub fn enumerations(&self) -> usize {
        self.state.lock().unwrap().enumerations
    }

    /// All durations the engines asked to sleep for.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().unwrap().sleeps.clone()
    }
}

impl UsbBus for MockBus {
    type Device = MockTransport;

    fn enumerate(&self, filter: &DeviceFilter) -> Result<Vec<MockTransport>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.enumerations += 1;
        let devices = match state.scripted.pop_front() {
            Some(result) => result?,
            None => state.attached.clone(),
        };
        Ok(devices
            .into_iter()
            .filter(|d| {
                filter.matches(d.description.vendor_id, d.description.product_id)
                    && filter.matches_interfaces(d.description.interface_classes())
            })
            .collect())
    }

    fn sleep(&self, duration: Duration) {
        self.state.lock().unwrap().sleeps.push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vid: u16, pid: u16) -> MockTransport {
        MockTransport::new(DeviceDescription {
            vendor_id: vid,
            product_id: pid,
            ..Default::default()
        })
    }

    #[test]
    fn test_mock_in_queue() {
        let mock = device(0x1234, 0x5678);
        mock.queue_in(3, &[1, 2, 3]);
        mock.queue_in(3, &[4]);

        let req = ControlRequest::vendor(3, 0, 0);
        let timeout = Duration::from_millis(100);
        assert_eq!(mock.control_in(req, 8, timeout).unwrap(), vec![1, 2, 3]);
        assert_eq!(mock.control_in(req, 8, timeout).unwrap(), vec![4]);

        // Queue is empty now
        assert!(matches!(
            mock.control_in(req, 8, timeout),
            Err(TransportError::Timeout { timeout_ms: 100 })
        ));
    }

    #[test]
    fn test_mock_write_capture() {
        let mock = device(0x1234, 0x5678);
        let timeout = Duration::from_millis(100);
        mock.control_out(ControlRequest::vendor(1, 2, 3), b"Hello", timeout)
            .unwrap();
        mock.fail_out(2, TransportError::Stall);
        assert!(
            mock.control_out(ControlRequest::vendor(2, 0, 0), &[], timeout)
                .is_err()
        );

        let writes = mock.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].data, b"Hello");
        assert_eq!(writes[0].request.value, 2);
        assert_eq!(writes[1].request.request, 2);
    }

    #[test]
    fn test_mock_disconnect() {
        let mock = device(0x1234, 0x5678);
        mock.disconnect();
        assert!(matches!(
            mock.control_out(ControlRequest::vendor(1, 0, 0), &[], Duration::ZERO),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn test_bus_filter_and_script() {
        let bus = MockBus::new();
        bus.attach(device(0x1234, 0x5678));
        bus.attach(device(0xAAAA, 0xBBBB));
        bus.script_enumeration(Vec::new());

        let filter = DeviceFilter {
            vendor_id: Some(0x1234),
            ..Default::default()
        };
        assert!(bus.enumerate(&filter).unwrap().is_empty());
        assert_eq!(bus.enumerate(&filter).unwrap().len(), 1);
        assert_eq!(bus.enumerations(), 2);

        bus.fail_enumeration(TransportError::Disconnected);
        assert!(bus.enumerate(&filter).is_err());
        assert_eq!(bus.enumerate(&filter).unwrap().len(), 1);

        // Neither device exposes a DFU interface.
        let dfu_only = filter.with_interface_class(0xFE, 0x01);
        assert!(bus.enumerate(&dfu_only).unwrap().is_empty());

        bus.sleep(Duration::from_millis(5));
        assert_eq!(bus.sleeps(), vec![Duration::from_millis(5)]);
    }
}
