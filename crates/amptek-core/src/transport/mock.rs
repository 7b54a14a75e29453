//! Mock transport for testing.
//!
//! Two modes share one type. A raw mock replays queued byte chunks and
//! captures writes. A simulated mock additionally decodes every request and
//! answers like a DPP would, with hooks for injecting faults.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{Connector, Discovery, Transport, TransportError, TransportId};
use crate::clock::{Clock, SystemClock};
use crate::protocol::command::spectrum_pid;
use crate::protocol::constants::*;
use crate::protocol::frame::{Frame, FrameDecoder, Pid};
use crate::protocol::status::DeviceModel;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock transport. Clones share all state, so a test can keep a handle
/// while a session owns another.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued byte chunks to return on read.
    rx_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Simulated device answering requests, if any.
    device: Arc<Mutex<Option<SimulatedDevice>>>,
    connected: Arc<Mutex<bool>>,
    open_fails: Arc<Mutex<bool>>,
    clock: Arc<dyn Clock>,
    id: TransportId,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            rx_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            device: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
            open_fails: Arc::new(Mutex::new(false)),
            clock: Arc::new(SystemClock),
            id: TransportId::Mock("raw".into()),
        }
    }

    /// Mock backed by a simulated device of the given model.
    pub fn simulated(model: DeviceModel) -> Self {
        let mock = Self::new().with_name(model.name());
        *lock(&mock.device) = Some(SimulatedDevice::new(model));
        mock
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.id = TransportId::Mock(name.to_string());
        self
    }

    /// Clock used to wait out read timeouts when nothing is queued.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Queue raw bytes to be returned by one read.
    pub fn queue_rx(&self, bytes: &[u8]) {
        lock(&self.rx_queue).push_back(bytes.to_vec());
    }

    /// Queue an encoded frame.
    pub fn queue_frame(&self, frame: &Frame) {
        if let Ok(bytes) = frame.to_bytes() {
            self.queue_rx(&bytes);
        }
    }

    /// Queue an acknowledgment packet.
    pub fn queue_ack(&self, code: u8) {
        self.queue_frame(&Frame::new(Pid::new(ACK_PID1, code), Vec::new()));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// Captured writes decoded as frames.
    pub fn written_frames(&self) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in self.get_writes() {
            decoder.push(&chunk);
            while let Ok(Some(frame)) = decoder.next_frame() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Text payloads of every configuration packet written so far.
    pub fn config_writes(&self) -> Vec<String> {
        self.written_frames()
            .into_iter()
            .filter(|f| f.pid == REQ_TEXT_CONFIG || f.pid == REQ_TEXT_CONFIG_NO_SAVE)
            .map(|f| String::from_utf8_lossy(&f.payload).into_owned())
            .collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    /// Simulate device unplug.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
        *lock(&self.open_fails) = true;
    }

    /// Simulate device replug.
    pub fn reconnect(&self) {
        *lock(&self.open_fails) = false;
    }

    /// Make the next opens fail, as when another process holds the device.
    pub fn set_open_fails(&self, fails: bool) {
        *lock(&self.open_fails) = fails;
    }

    /// Run `f` against the simulated device, if there is one.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut SimulatedDevice) -> R) -> Option<R> {
        lock(&self.device).as_mut().map(f)
    }

    /// Current value of a parameter on the simulated device.
    pub fn param(&self, code: &str) -> Option<String> {
        self.with_device(|d| d.params.get(code).cloned()).flatten()
    }

    /// Connector that hands out clones of this mock.
    pub fn connector(&self) -> MockConnector {
        MockConnector {
            transport: self.clone(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        lock(&self.write_log).push(data.to_vec());

        let mut device = lock(&self.device);
        if let Some(device) = device.as_mut() {
            let mut decoder = FrameDecoder::new();
            decoder.push(data);
            loop {
                match decoder.next_frame() {
                    Ok(Some(request)) => {
                        for reply in device.respond(&request) {
                            if let Ok(bytes) = reply.to_bytes() {
                                lock(&self.rx_queue).push_back(bytes);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        let nak = Frame::new(Pid::new(ACK_PID1, ACK_CHECKSUM_ERROR), Vec::new());
                        if let Ok(bytes) = nak.to_bytes() {
                            lock(&self.rx_queue).push_back(bytes);
                        }
                    }
                }
            }
        }
        Ok(data.len())
    }

    fn read(&mut self, _max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*lock(&self.connected) {
            return Err(TransportError::Disconnected);
        }
        let next = lock(&self.rx_queue).pop_front();
        match next {
            Some(bytes) => Ok(bytes),
            None => {
                self.clock.sleep(timeout);
                Ok(Vec::new())
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        *lock(&self.connected) = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *lock(&self.connected)
    }

    fn id(&self) -> &TransportId {
        &self.id
    }
}

/// Hands out clones of a [`MockTransport`].
pub struct MockConnector {
    transport: MockTransport,
}

impl Connector for MockConnector {
    fn id(&self) -> &TransportId {
        &self.transport.id
    }

    fn open(&self) -> Result<Box<dyn Transport>, TransportError> {
        if *lock(&self.transport.open_fails) {
            return Err(TransportError::OpenFailed(format!(
                "{} is unavailable",
                self.transport.id
            )));
        }
        *lock(&self.transport.connected) = true;
        lock(&self.transport.rx_queue).clear();
        Ok(Box::new(self.transport.clone()))
    }
}

/// Discovery over a fixed set of mocks.
#[derive(Clone, Default)]
pub struct MockDiscovery {
    pub devices: Vec<MockTransport>,
}

impl Discovery for MockDiscovery {
    fn enumerate(&self) -> Result<Vec<Box<dyn Connector>>, TransportError> {
        Ok(self
            .devices
            .iter()
            .filter(|d| !*lock(&d.open_fails))
            .map(|d| Box::new(d.connector()) as Box<dyn Connector>)
            .collect())
    }
}

/// In-memory DPP that answers the request set used by sessions.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub model: DeviceModel,
    pub serial_number: u32,
    /// Parameter values as last written, keyed by code.
    pub params: BTreeMap<String, String>,
    pub mca_enabled: bool,
    pub hv_polarity_positive: bool,
    /// Stop answering entirely.
    pub silent: bool,
    /// Codes answered with a Bad Parameter ACK.
    pub rejected: BTreeSet<String>,
    /// Fail every configuration packet after this many succeeded.
    pub fail_config_after: Option<usize>,
    /// Configuration packets accepted so far.
    pub config_packets: usize,
    /// Configuration packets that asked for a flash save.
    pub flash_saves: usize,
}

impl SimulatedDevice {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            model,
            serial_number: 40_000 + model as u32,
            params: BTreeMap::new(),
            mca_enabled: false,
            hv_polarity_positive: true,
            silent: false,
            rejected: BTreeSet::new(),
            fail_config_after: None,
            config_packets: 0,
            flash_saves: 0,
        }
    }

    fn channels(&self) -> usize {
        self.params
            .get("MCAC")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1024)
    }

    fn default_param(code: &str) -> &'static str {
        match code {
            "HVSE" => "OFF",
            "MCAC" => "1024",
            "PRET" | "PRER" | "PREC" | "PREL" => "OFF",
            _ => "0",
        }
    }

    fn ack(code: u8, payload: Vec<u8>) -> Frame {
        Frame::new(Pid::new(ACK_PID1, code), payload)
    }

    pub fn respond(&mut self, request: &Frame) -> Vec<Frame> {
        if self.silent {
            return Vec::new();
        }
        let reply = match request.pid {
            REQ_STATUS => Frame::new(RESP_STATUS, self.status_bytes()),
            REQ_SPECTRUM => self.spectrum(),
            REQ_TEXT_CONFIG | REQ_TEXT_CONFIG_NO_SAVE => {
                self.configure(&request.payload, request.pid == REQ_TEXT_CONFIG)
            }
            REQ_TEXT_CONFIG_READBACK => self.readback(&request.payload),
            REQ_CLEAR_SPECTRUM | REQ_AUTOSET_OFFSET | REQ_AUTOSET_FAST_THRESH => {
                Self::ack(ACK_OK, Vec::new())
            }
            REQ_ENABLE_MCA => {
                self.mca_enabled = true;
                Self::ack(ACK_OK, Vec::new())
            }
            REQ_DISABLE_MCA => {
                self.mca_enabled = false;
                Self::ack(ACK_OK, Vec::new())
            }
            REQ_COMM_TEST_ECHO => Frame::new(RESP_COMM_TEST_ECHO, request.payload.clone()),
            _ => Self::ack(ACK_UNRECOGNIZED_COMMAND, Vec::new()),
        };
        vec![reply]
    }

    fn configure(&mut self, payload: &[u8], save: bool) -> Frame {
        if let Some(limit) = self.fail_config_after
            && self.config_packets >= limit
        {
            return Self::ack(ACK_BUSY, Vec::new());
        }
        let text = String::from_utf8_lossy(payload);
        let mut updates = Vec::new();
        for command in text.split(';').filter(|c| !c.is_empty()) {
            let Some((code, value)) = command.split_once('=') else {
                return Self::ack(ACK_BAD_PARAMETER, command.as_bytes().to_vec());
            };
            if self.rejected.contains(code) {
                return Self::ack(ACK_BAD_PARAMETER, command.as_bytes().to_vec());
            }
            updates.push((code.to_string(), value.to_string()));
        }
        for (code, value) in updates {
            if code != "RESC" {
                self.params.insert(code, value);
            }
        }
        self.config_packets += 1;
        if save {
            self.flash_saves += 1;
        }
        Self::ack(ACK_OK, Vec::new())
    }

    fn readback(&self, payload: &[u8]) -> Frame {
        let text = String::from_utf8_lossy(payload);
        let mut reply = String::new();
        for code in text.split(';').filter(|c| !c.is_empty()) {
            if self.rejected.contains(code) {
                return Self::ack(ACK_BAD_PARAMETER, code.as_bytes().to_vec());
            }
            let value = self
                .params
                .get(code)
                .map(String::as_str)
                .unwrap_or(Self::default_param(code));
            reply.push_str(&format!("{}={};", code, value));
        }
        Frame::new(RESP_CONFIG_READBACK, reply.into_bytes())
    }

    fn spectrum(&self) -> Frame {
        let channels = self.channels();
        let Some(pid) = spectrum_pid(channels) else {
            return Self::ack(ACK_BAD_PARAMETER, Vec::new());
        };
        let mut payload = Vec::with_capacity(channels * BYTES_PER_CHANNEL);
        for i in 0..channels as u32 {
            let count = (i * 7919) % 1031;
            payload.extend_from_slice(&count.to_le_bytes()[..BYTES_PER_CHANNEL]);
        }
        Frame::new(pid, payload)
    }

    fn status_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; STATUS_LEN];
        data[24] = 0x68;
        data[25] = 0x63;
        data[26..30].copy_from_slice(&self.serial_number.to_le_bytes());
        let hv = self
            .params
            .get("HVSE")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        data[30..32].copy_from_slice(&((hv * 2.0) as i16).to_be_bytes());
        data[34] = 30;
        if self.mca_enabled {
            data[35] |= 0x20;
        }
        data[35] |= 0x02;
        if self.hv_polarity_positive {
            data[38] |= 0x40;
        }
        data[39] = self.model as u8;
        data[48] = 0x7F;
        data
    }
}
