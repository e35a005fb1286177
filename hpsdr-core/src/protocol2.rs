//! Protocol 2 (modern/Ethernet): six UDP ports, per-source-port sends, and
//! independent high-priority status / DDC I/Q / mic streaming tasks.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

use crate::codec::{pack_iq_24bit, unpack_tx_audio_16bit, unpack_tx_iq_24bit};
use crate::echo::EchoBuffer;
use crate::errors::{BindError, RadioError};
use crate::radio::RadioState;
use crate::siggen::SignalGenerator;

// Host -> radio ports.
pub const PORT_GENERAL: u16 = 1024;
pub const PORT_RX_SPECIFIC: u16 = 1025;
pub const PORT_TX_SPECIFIC: u16 = 1026;
pub const PORT_HIGH_PRIORITY: u16 = 1027;
pub const PORT_TX_AUDIO: u16 = 1028;
pub const PORT_TX_IQ: u16 = 1029;

// Radio -> host ports. 1025/1026 are shared with their receive sockets; deskHPSDR
// and Thetis both demultiplex inbound traffic by source port.
pub const PORT_HP_STATUS: u16 = PORT_RX_SPECIFIC;
pub const PORT_MIC: u16 = PORT_TX_SPECIFIC;
pub const PORT_DDC_BASE: u16 = 1035;

const SAMPLES_PER_DDC_PACKET: usize = 238;
const SAMPLES_PER_MIC_PACKET: usize = 64;
const HP_STATUS_INTERVAL: Duration = Duration::from_millis(100);
const ECHO_TX_TIMEOUT: Duration = Duration::from_secs(1);
const ECHO_TX_WATCHDOG_TICK: Duration = Duration::from_millis(200);

const RECV_PORTS: [u16; 6] = [
    PORT_GENERAL,
    PORT_RX_SPECIFIC,
    PORT_TX_SPECIFIC,
    PORT_HIGH_PRIORITY,
    PORT_TX_AUDIO,
    PORT_TX_IQ,
];

/// Protocol 2 multi-port UDP engine.
///
/// Single-owner by design: runs on a current-thread executor and is shared via
/// `Rc`, never sent across OS threads (see DESIGN.md).
pub struct Protocol2 {
    state: Rc<RefCell<RadioState>>,
    siggen: Rc<RefCell<SignalGenerator>>,
    echo: Option<Rc<RefCell<EchoBuffer>>>,

    recv_sockets: HashMap<u16, Rc<UdpSocket>>,
    send_sockets: HashMap<u16, Rc<UdpSocket>>,

    client_addr: RefCell<Option<SocketAddr>>,
    streaming: Cell<bool>,
    generation: Cell<u64>,

    echo_tx_active: Cell<bool>,
    echo_last_tx: Cell<Option<Instant>>,
}

impl Protocol2 {
    /// Bind the six host-facing ports plus one DDC I/Q send socket per active DDC.
    pub async fn bind(
        state: Rc<RefCell<RadioState>>,
        siggen: Rc<RefCell<SignalGenerator>>,
        echo: Option<Rc<RefCell<EchoBuffer>>>,
    ) -> Result<Rc<Self>, RadioError> {
        let mut recv_sockets = HashMap::new();
        for port in RECV_PORTS {
            let socket = UdpSocket::bind(("0.0.0.0", port))
                .await
                .map_err(|source| BindError::Port { port, source })?;
            log::info!("Protocol 2 listening on UDP port {port}");
            recv_sockets.insert(port, Rc::new(socket));
        }

        let mut send_sockets = HashMap::new();
        send_sockets.insert(PORT_HP_STATUS, recv_sockets[&PORT_RX_SPECIFIC].clone());
        send_sockets.insert(PORT_MIC, recv_sockets[&PORT_TX_SPECIFIC].clone());

        let nddc = state.borrow().nddc;
        for ddc in 0..nddc {
            let port = PORT_DDC_BASE + u16::from(ddc);
            let socket = UdpSocket::bind(("0.0.0.0", port))
                .await
                .map_err(|source| BindError::Port { port, source })?;
            log::info!("Protocol 2 send socket on port {port}");
            send_sockets.insert(port, Rc::new(socket));
        }

        {
            let s = state.borrow();
            log::info!("Radio: {} (code={}, DDCs={})", s.hw.name, s.hw.code, s.nddc);
            log::info!(
                "MAC: {}",
                s.mac
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            );
        }

        Ok(Rc::new(Self {
            state,
            siggen,
            echo,
            recv_sockets,
            send_sockets,
            client_addr: RefCell::new(None),
            streaming: Cell::new(false),
            generation: Cell::new(0),
            echo_tx_active: Cell::new(false),
            echo_last_tx: Cell::new(None),
        }))
    }

    /// Spawn a receive loop per bound port and, if an echo buffer is present, the
    /// TX-idle watchdog. Must run inside a `tokio::task::LocalSet`.
    pub async fn run(self: Rc<Self>) -> Result<(), RadioError> {
        for &port in &RECV_PORTS {
            let this = self.clone();
            tokio::task::spawn_local(async move { this.recv_loop(port).await });
        }
        if self.echo.is_some() {
            let this = self.clone();
            tokio::task::spawn_local(async move { this.echo_tx_watchdog().await });
        }
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn recv_loop(self: Rc<Self>, port: u16) {
        let socket = self.recv_sockets[&port].clone();
        let mut buf = vec![0u8; 2048];
        loop {
            let (n, addr) = match socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::error!("Protocol 2 recv error on port {port}: {e}");
                    continue;
                }
            };
            Rc::clone(&self).handle_packet(port, &buf[..n], addr);
        }
    }

    fn handle_packet(self: Rc<Self>, port: u16, data: &[u8], addr: SocketAddr) {
        match port {
            PORT_GENERAL => self.handle_general(data, addr),
            PORT_RX_SPECIFIC => self.handle_rx_specific(data, addr),
            PORT_TX_SPECIFIC => self.handle_tx_specific(addr),
            PORT_HIGH_PRIORITY => self.handle_high_priority(data, addr),
            PORT_TX_AUDIO => self.handle_tx_audio(data, addr),
            PORT_TX_IQ => self.handle_tx_iq(data, addr),
            _ => {}
        }
    }

    fn handle_general(&self, data: &[u8], addr: SocketAddr) {
        if data.len() < 5 {
            return;
        }
        if data[4] == 0x02 {
            log::info!("P2 discovery request from {addr}");
            let resp = self.build_discovery_response();
            let socket = self.recv_sockets[&PORT_GENERAL].clone();
            tokio::task::spawn_local(async move {
                if let Err(e) = socket.send_to(&resp, addr).await {
                    log::warn!("P2 discovery response send failed: {e}");
                }
            });
        } else if data[4] == 0x00 {
            log::debug!("P2 general config from {addr}");
            *self.client_addr.borrow_mut() = Some(addr);
        }
    }

    fn build_discovery_response(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 60];
        let s = self.state.borrow();
        buf[4] = 0x02;
        buf[5..11].copy_from_slice(&s.mac);
        buf[11] = s.hw.code;
        buf[12] = 1;
        buf[13] = s.firmware_version;
        buf[14] = s.mercury_versions[0];
        buf[15] = s.mercury_versions[1];
        buf[16] = s.mercury_versions[2];
        buf[17] = s.mercury_versions[3];
        buf[18] = s.penny_version;
        buf[19] = s.metis_version;
        buf[20] = s.nddc;
        buf
    }

    fn handle_rx_specific(&self, data: &[u8], addr: SocketAddr) {
        if data.len() < 5 {
            return;
        }
        *self.client_addr.borrow_mut() = Some(addr);
        log::debug!("P2 RX-specific config from {addr} ({} bytes)", data.len());

        if data.len() > 7 {
            let enabled_bits = data[7];
            let count = enabled_bits.count_ones();
            let nddc = self.state.borrow().nddc;
            if count > 0 && u32::from(nddc) != count {
                log::info!("P2 enabled RXs: {count} (bits=0x{enabled_bits:02x})");
            }
        }

        if data.len() > 19 {
            let sr_khz = u16::from_be_bytes([data[18], data[19]]);
            if sr_khz > 0 {
                let sr_hz = u32::from(sr_khz) * 1000;
                let mut s = self.state.borrow_mut();
                if sr_hz != s.sample_rate {
                    log::info!("P2 RX0 sample rate -> {sr_hz} Hz");
                    s.sample_rate = sr_hz;
                    self.siggen.borrow_mut().sample_rate = sr_hz;
                }
            }
        }
    }

    fn handle_tx_specific(&self, addr: SocketAddr) {
        *self.client_addr.borrow_mut() = Some(addr);
        log::debug!("P2 TX-specific config from {addr}");
    }

    fn handle_high_priority(self: Rc<Self>, data: &[u8], addr: SocketAddr) {
        if data.len() < 57 {
            return;
        }
        *self.client_addr.borrow_mut() = Some(addr);

        let flags = data[4];
        let run = flags & 0x01 != 0;
        let ptt = flags & 0x02 != 0;

        {
            let mut s = self.state.borrow_mut();
            if ptt != s.ptt {
                log::info!("P2 PTT -> {ptt}");
                s.ptt = ptt;
                if let Some(echo) = &self.echo {
                    if !ptt && self.echo_tx_active.get() {
                        self.echo_tx_active.set(false);
                        echo.borrow_mut().stop_recording();
                    }
                }
            }

            for i in 0..12 {
                let off = 9 + i * 4;
                if off + 4 <= data.len() {
                    let freq = u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]]);
                    if freq > 0 && i < s.rx_frequencies.len() && s.rx_frequencies[i] != freq {
                        log::info!("P2 RX{i} freq -> {freq} Hz");
                        s.rx_frequencies[i] = freq;
                    }
                }
            }

            if data.len() > 332 {
                let tx_freq = u32::from_be_bytes([data[329], data[330], data[331], data[332]]);
                if tx_freq > 0 && s.tx_frequency != tx_freq {
                    log::info!("P2 TX freq -> {tx_freq} Hz");
                    s.tx_frequency = tx_freq;
                }
            }

            if data.len() > 345 {
                let drive = data[345];
                if s.tx_drive != drive {
                    log::info!("P2 TX drive -> {drive}");
                    s.tx_drive = drive;
                }
            }
        }

        let running = self.state.borrow().running;
        if run && !running {
            self.state.borrow_mut().running = true;
            log::info!("P2 RUN -> started");
            self.start_streaming();
        } else if !run && running {
            self.state.borrow_mut().running = false;
            log::info!("P2 RUN -> stopped");
            self.stop_streaming();
        }
    }

    fn handle_tx_audio(&self, data: &[u8], addr: SocketAddr) {
        *self.client_addr.borrow_mut() = Some(addr);
        let Some(echo) = &self.echo else { return };
        if !self.state.borrow().ptt || data.len() <= 4 {
            return;
        }
        let payload = &data[4..];
        let tx_iq = if payload.len() % 6 == 0 && payload.len() >= 6 * 60 {
            unpack_tx_iq_24bit(payload)
        } else if payload.len() % 4 == 0 {
            unpack_tx_audio_16bit(payload)
        } else {
            return;
        };
        self.echo_feed_tx(echo, &tx_iq);
    }

    fn handle_tx_iq(&self, data: &[u8], addr: SocketAddr) {
        *self.client_addr.borrow_mut() = Some(addr);
        let Some(echo) = &self.echo else { return };
        if !self.state.borrow().ptt || data.len() <= 4 {
            return;
        }
        let tx_iq = unpack_tx_iq_24bit(&data[4..]);
        self.echo_feed_tx(echo, &tx_iq);
    }

    fn echo_feed_tx(&self, echo: &Rc<RefCell<EchoBuffer>>, tx_iq: &[num_complex::Complex64]) {
        if !self.echo_tx_active.get() {
            self.echo_tx_active.set(true);
            let tx_freq = self.state.borrow().tx_frequency;
            echo.borrow_mut().start_recording(tx_freq);
        }
        echo.borrow_mut().feed(tx_iq);
        self.echo_last_tx.set(Some(Instant::now()));
    }

    /// Polling stand-in for the original's per-feed `call_later` reset: a fixed
    /// tick is simpler to reason about on a cooperative executor and has the same
    /// externally observable effect (recording stops within ~1s of the last TX sample).
    async fn echo_tx_watchdog(self: Rc<Self>) {
        loop {
            tokio::time::sleep(ECHO_TX_WATCHDOG_TICK).await;
            if !self.echo_tx_active.get() {
                continue;
            }
            let idle = self
                .echo_last_tx
                .get()
                .map(|t| t.elapsed() >= ECHO_TX_TIMEOUT)
                .unwrap_or(false);
            if idle {
                self.echo_tx_active.set(false);
                if let Some(echo) = &self.echo {
                    echo.borrow_mut().stop_recording();
                }
                log::info!("P2 echo: TX data timeout (fallback), recording stopped");
            }
        }
    }

    fn start_streaming(self: Rc<Self>) {
        let generation = self.generation.get().wrapping_add(1);
        self.generation.set(generation);
        self.streaming.set(true);

        let this = self.clone();
        tokio::task::spawn_local(async move { this.hp_status_loop(generation).await });

        let nddc = self.state.borrow().nddc;
        for ddc in 0..nddc {
            let this = self.clone();
            tokio::task::spawn_local(async move { this.ddc_iq_loop(ddc, generation).await });
        }

        let this = self.clone();
        tokio::task::spawn_local(async move { this.mic_loop(generation).await });

        log::info!("P2 started {} stream tasks (nddc={nddc})", 2 + usize::from(nddc));
    }

    fn stop_streaming(&self) {
        self.streaming.set(false);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.streaming.get() && self.generation.get() == generation
    }

    fn send_to_client(&self, source_port: u16, data: Vec<u8>) {
        let addr = *self.client_addr.borrow();
        let socket = self.send_sockets.get(&source_port).cloned();
        if let (Some(addr), Some(socket)) = (addr, socket) {
            tokio::task::spawn_local(async move {
                if let Err(e) = socket.send_to(&data, addr).await {
                    log::warn!("P2 send on port {source_port} failed: {e}");
                }
            });
        }
    }

    async fn hp_status_loop(self: Rc<Self>, generation: u64) {
        while self.is_current(generation) {
            let pkt = self.build_hp_status();
            self.send_to_client(PORT_HP_STATUS, pkt);
            tokio::time::sleep(HP_STATUS_INTERVAL).await;
        }
    }

    fn build_hp_status(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 60];
        let mut s = self.state.borrow_mut();
        let seq = s.next_seq("hp_status");
        buf[0..4].copy_from_slice(&seq.to_be_bytes());
        buf[4] = u8::from(s.ptt);

        if s.ptt && s.tx_drive > 0 {
            let exc = u16::from(s.tx_drive) * 10;
            let fwd = (u16::from(s.tx_drive) * u16::from(s.tx_drive)) >> 4;
            let rev = (fwd / 50).max(1);
            buf[6..8].copy_from_slice(&exc.to_be_bytes());
            buf[14..16].copy_from_slice(&fwd.to_be_bytes());
            buf[22..24].copy_from_slice(&rev.to_be_bytes());
        }
        drop(s);
        buf
    }

    async fn ddc_iq_loop(self: Rc<Self>, ddc_index: u8, generation: u64) {
        let source_port = PORT_DDC_BASE + u16::from(ddc_index);
        let stream_name = format!("ddc_{ddc_index}");
        log::info!("P2 DDC{ddc_index} I/Q stream from port {source_port}");

        while self.is_current(generation) {
            let pkt = self.build_ddc_iq_packet(ddc_index, &stream_name);
            self.send_to_client(source_port, pkt);

            let sample_rate = self.state.borrow().sample_rate;
            let interval = Duration::from_secs_f64(SAMPLES_PER_DDC_PACKET as f64 / f64::from(sample_rate));
            tokio::time::sleep(interval).await;
        }
    }

    fn build_ddc_iq_packet(&self, ddc_index: u8, stream_name: &str) -> Vec<u8> {
        let seq = self.state.borrow_mut().next_seq(stream_name);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut header = Vec::with_capacity(16);
        header.extend_from_slice(&seq.to_be_bytes());
        header.extend_from_slice(&timestamp.to_be_bytes());
        header.extend_from_slice(&24u16.to_be_bytes());
        header.extend_from_slice(&(SAMPLES_PER_DDC_PACKET as u16).to_be_bytes());

        let (rx_freq, sample_rate) = {
            let s = self.state.borrow();
            (s.rx_frequencies[ddc_index as usize], s.sample_rate)
        };
        let iq = if let Some(echo) = &self.echo {
            echo.borrow_mut()
                .generate_echo(SAMPLES_PER_DDC_PACKET, rx_freq, sample_rate)
        } else {
            self.siggen
                .borrow_mut()
                .generate_iq(SAMPLES_PER_DDC_PACKET, ddc_index)
        };
        header.extend_from_slice(&pack_iq_24bit(&iq));
        header
    }

    async fn mic_loop(self: Rc<Self>, generation: u64) {
        while self.is_current(generation) {
            let pkt = self.build_mic_packet();
            self.send_to_client(PORT_MIC, pkt);
            tokio::time::sleep(Duration::from_secs_f64(SAMPLES_PER_MIC_PACKET as f64 / 48_000.0)).await;
        }
    }

    fn build_mic_packet(&self) -> Vec<u8> {
        let seq = self.state.borrow_mut().next_seq("mic");
        let mut pkt = Vec::with_capacity(4 + SAMPLES_PER_MIC_PACKET * 2);
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend(std::iter::repeat(0u8).take(SAMPLES_PER_MIC_PACKET * 2));
        pkt
    }
}
