//! Protocol 1 (legacy): one UDP socket on port 1024, Thetis-style C0-C4
//! control words folded into 512-byte sub-frames of a 1032-byte packet.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::net::UdpSocket;
use tokio::time::Duration;

use crate::codec::{encode_i24, unpack_tx_iq_16bit};
use crate::echo::EchoBuffer;
use crate::errors::{BindError, RadioError};
use crate::radio::{RadioState, SAMPLE_RATES_P1};
use crate::siggen::SignalGenerator;

pub const PORT: u16 = 1024;
const PACKET_SIZE: usize = 1032;
const SUBFRAME_SIZE: usize = 512;
const SYNC: [u8; 3] = [0x7F, 0x7F, 0x7F];

/// Response C0 addresses the radio rotates through on its reply sub-frames.
const RESPONSE_ADDRS: [u8; 4] = [0x00, 0x08, 0x10, 0x18];

/// Protocol 1 UDP engine: discovery, start/stop, host-data parsing, and the
/// outbound data-streaming loop.
///
/// Single-owner by design: runs on a current-thread executor and is shared via
/// `Rc`, never sent across OS threads (see DESIGN.md).
pub struct Protocol1 {
    socket: Rc<UdpSocket>,
    state: Rc<RefCell<RadioState>>,
    siggen: Rc<RefCell<SignalGenerator>>,
    echo: Option<Rc<RefCell<EchoBuffer>>>,

    client_addr: RefCell<Option<SocketAddr>>,
    control_idx: Cell<usize>,
    streaming: Cell<bool>,
}

impl Protocol1 {
    /// Bind the single Protocol 1 UDP port.
    pub async fn bind(
        state: Rc<RefCell<RadioState>>,
        siggen: Rc<RefCell<SignalGenerator>>,
        echo: Option<Rc<RefCell<EchoBuffer>>>,
    ) -> Result<Rc<Self>, RadioError> {
        let socket = UdpSocket::bind(("0.0.0.0", PORT))
            .await
            .map_err(|source| BindError::Port { port: PORT, source })?;
        log::info!("Protocol 1 listening on UDP port {PORT}");
        Ok(Rc::new(Self {
            socket: Rc::new(socket),
            state,
            siggen,
            echo,
            client_addr: RefCell::new(None),
            control_idx: Cell::new(0),
            streaming: Cell::new(false),
        }))
    }

    /// Receive and dispatch packets until the socket errs or the task is cancelled.
    /// Must run inside a `tokio::task::LocalSet` since it spawns `!Send` streaming
    /// tasks sharing `Rc` state.
    pub async fn run(self: Rc<Self>) -> Result<(), RadioError> {
        {
            let state = self.state.borrow();
            log::info!(
                "Radio: {} (code={}, DDCs={})",
                state.hw.name,
                state.hw.code,
                state.nddc
            );
            log::info!(
                "MAC: {}",
                state
                    .mac
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            );
        }

        let mut buf = vec![0u8; 2048];
        loop {
            let (n, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    log::error!("Protocol 1 recv error: {e}");
                    continue;
                }
            };
            Rc::clone(&self).dispatch(&buf[..n], addr);
        }
    }

    fn dispatch(self: Rc<Self>, data: &[u8], addr: SocketAddr) {
        if data.len() < 4 || data[0] != 0xEF || data[1] != 0xFE {
            return;
        }
        match data[2] {
            0x02 => self.handle_discovery(addr),
            0x04 => {
                if data.len() > 3 {
                    if data[3] == 0x01 {
                        self.handle_start(addr);
                    } else if data[3] == 0x00 {
                        self.handle_stop();
                    }
                }
            }
            0x01 => self.handle_host_data(data, addr),
            _ => {}
        }
    }

    fn handle_discovery(&self, addr: SocketAddr) {
        log::info!("P1 discovery request from {addr}");
        let resp = self.build_discovery_response();
        let socket = self.socket.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = socket.send_to(&resp, addr).await {
                log::warn!("P1 discovery response send failed: {e}");
            }
        });
    }

    fn build_discovery_response(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 60];
        let s = self.state.borrow();
        buf[0] = 0xEF;
        buf[1] = 0xFE;
        buf[2] = 0x02;
        buf[3..9].copy_from_slice(&s.mac);
        buf[9] = s.firmware_version;
        buf[10] = s.hw.code;
        buf[11] = 0;
        buf[14] = s.mercury_versions[0];
        buf[15] = s.mercury_versions[1];
        buf[16] = s.mercury_versions[2];
        buf[17] = s.mercury_versions[3];
        buf[18] = s.penny_version;
        buf[19] = s.metis_version;
        buf[20] = s.nddc;
        buf
    }

    fn handle_start(self: Rc<Self>, addr: SocketAddr) {
        log::info!("P1 start streaming to {addr}");
        *self.client_addr.borrow_mut() = Some(addr);
        self.state.borrow_mut().running = true;
        if !self.streaming.get() {
            self.streaming.set(true);
            tokio::task::spawn_local(async move { self.stream_loop().await });
        }
    }

    fn handle_stop(&self) {
        log::info!("P1 stop streaming");
        self.state.borrow_mut().running = false;
        self.streaming.set(false);
    }

    fn handle_host_data(&self, data: &[u8], addr: SocketAddr) {
        if data.len() < PACKET_SIZE {
            return;
        }
        *self.client_addr.borrow_mut() = Some(addr);

        for offset in [8usize, 520] {
            let sf = &data[offset..offset + SUBFRAME_SIZE];
            if sf[0..3] != SYNC {
                continue;
            }
            let (c0, c1, c2, c3, c4) = (sf[3], sf[4], sf[5], sf[6], sf[7]);
            self.process_control(c0, c1, c2, c3, c4);

            let ptt = self.state.borrow().ptt;
            if let Some(echo) = &self.echo {
                if ptt {
                    let tx_data = &sf[8..8 + 63 * 8];
                    let tx_iq = unpack_tx_iq_16bit(tx_data);
                    echo.borrow_mut().feed(&tx_iq);
                }
            }
        }
    }

    /// `C0` bit 0 is MOX (PTT), bits [7:1] address which command `C1..C4` carry.
    fn process_control(&self, c0: u8, c1: u8, c2: u8, c3: u8, c4: u8) {
        let mut s = self.state.borrow_mut();
        let mox = c0 & 0x01 != 0;
        let addr = c0 & 0xFE;

        if mox != s.ptt {
            log::info!("P1 MOX -> {mox}");
            s.ptt = mox;
            if let Some(echo) = &self.echo {
                if mox {
                    echo.borrow_mut().start_recording(s.tx_frequency);
                } else {
                    echo.borrow_mut().stop_recording();
                }
            }
        }

        match addr {
            0x00 => {
                let rate_code = c1 & 0x03;
                if let Some((rate, _)) = SAMPLE_RATES_P1.iter().find(|(_, code)| *code == rate_code)
                {
                    if s.sample_rate != *rate {
                        log::info!("P1 sample rate -> {rate} Hz");
                        s.sample_rate = *rate;
                        self.siggen.borrow_mut().sample_rate = *rate;
                    }
                }
                let nddc = ((c4 >> 3) & 0x07) + 1;
                if nddc != s.nddc {
                    log::info!("P1 active DDCs -> {nddc}");
                    s.nddc = nddc;
                }
            }
            0x02 => {
                let freq = u32::from_be_bytes([c1, c2, c3, c4]);
                if s.tx_frequency != freq {
                    log::info!("P1 TX freq -> {freq} Hz");
                    s.tx_frequency = freq;
                }
            }
            a if (0x04..0x12).contains(&a) && a % 2 == 0 => {
                let ddc_idx = ((a - 0x04) / 2) as usize;
                let freq = u32::from_be_bytes([c1, c2, c3, c4]);
                if ddc_idx < s.rx_frequencies.len() && s.rx_frequencies[ddc_idx] != freq {
                    log::info!("P1 RX{ddc_idx} freq -> {freq} Hz");
                    s.rx_frequencies[ddc_idx] = freq;
                }
            }
            0x12 => {
                if s.tx_drive != c1 {
                    log::info!("P1 TX drive -> {c1}");
                    s.tx_drive = c1;
                }
            }
            _ => {}
        }
    }

    async fn stream_loop(self: Rc<Self>) {
        {
            let s = self.state.borrow();
            log::info!(
                "P1 streaming started (nddc={}, rate={})",
                s.nddc,
                s.sample_rate
            );
        }
        while self.streaming.get() && self.state.borrow().running {
            let Some(addr) = *self.client_addr.borrow() else {
                break;
            };
            let packet = self.build_data_packet();
            if let Err(e) = self.socket.send_to(&packet, addr).await {
                log::warn!("P1 stream send failed: {e}");
            }

            let (nddc, sample_rate) = {
                let s = self.state.borrow();
                (s.nddc.max(1) as usize, s.sample_rate)
            };
            let spr = 504 / (6 * nddc + 2);
            let samples_per_packet = spr * 2;
            let interval = Duration::from_secs_f64(samples_per_packet as f64 / f64::from(sample_rate));
            tokio::time::sleep(interval).await;
        }
        log::info!("P1 streaming stopped");
    }

    fn build_data_packet(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PACKET_SIZE];
        let seq = self.state.borrow_mut().next_seq("p1_data");

        buf[0] = 0xEF;
        buf[1] = 0xFE;
        buf[2] = 0x01;
        buf[3] = 0x06;
        buf[4..8].copy_from_slice(&seq.to_be_bytes());

        for offset in [8usize, 520] {
            self.fill_subframe(&mut buf, offset);
        }
        buf
    }

    fn fill_subframe(&self, buf: &mut [u8], offset: usize) {
        let nddc = self.state.borrow().nddc.max(1) as usize;
        let spr = 504 / (6 * nddc + 2);

        buf[offset] = 0x7F;
        buf[offset + 1] = 0x7F;
        buf[offset + 2] = 0x7F;

        let idx = self.control_idx.get();
        let c0_addr = RESPONSE_ADDRS[idx % RESPONSE_ADDRS.len()];
        self.control_idx.set((idx + 1) % RESPONSE_ADDRS.len());

        let (ptt, tx_drive, firmware_version, penny_version) = {
            let s = self.state.borrow();
            (s.ptt, s.tx_drive, s.firmware_version, s.penny_version)
        };
        let ptt_bit = u8::from(ptt);
        buf[offset + 3] = c0_addr | 0x80 | ptt_bit;

        match c0_addr {
            0x00 => {
                buf[offset + 4] = 0x00;
                buf[offset + 5] = firmware_version;
                buf[offset + 6] = penny_version;
                buf[offset + 7] = 0x00;
            }
            0x08 => {
                let (exc, fwd) = if ptt {
                    (
                        u16::from(tx_drive) * 10,
                        (u16::from(tx_drive) * u16::from(tx_drive)) >> 4,
                    )
                } else {
                    (0, 0)
                };
                buf[offset + 4..offset + 6].copy_from_slice(&exc.to_be_bytes());
                buf[offset + 6..offset + 8].copy_from_slice(&fwd.to_be_bytes());
            }
            0x10 => {
                let rev = if ptt && tx_drive > 0 {
                    let fwd = (u16::from(tx_drive) * u16::from(tx_drive)) >> 4;
                    (fwd / 50).max(1)
                } else {
                    0
                };
                let supply = 3200u16;
                buf[offset + 4..offset + 6].copy_from_slice(&rev.to_be_bytes());
                buf[offset + 6..offset + 8].copy_from_slice(&supply.to_be_bytes());
            }
            0x18 => {
                let pa_amps = if ptt { u16::from(tx_drive) * 5 } else { 0 };
                let supply = 3200u16;
                buf[offset + 4..offset + 6].copy_from_slice(&pa_amps.to_be_bytes());
                buf[offset + 6..offset + 8].copy_from_slice(&supply.to_be_bytes());
            }
            _ => {
                buf[offset + 4..offset + 8].fill(0);
            }
        }

        let (sample_rate, rx_frequencies) = {
            let s = self.state.borrow();
            (s.sample_rate, s.rx_frequencies)
        };
        let mut ddc_samples = Vec::with_capacity(nddc);
        for ddc in 0..nddc {
            let iq = if let Some(echo) = &self.echo {
                echo.borrow_mut()
                    .generate_echo(spr, rx_frequencies[ddc], sample_rate)
            } else {
                self.siggen.borrow_mut().generate_iq(spr, ddc as u8)
            };
            ddc_samples.push(iq);
        }

        let mut data_offset = offset + 8;
        for row in 0..spr {
            for ddc_iq in ddc_samples.iter().take(nddc) {
                let sample = ddc_iq[row];
                let i_bytes = encode_i24(sample.re);
                let q_bytes = encode_i24(sample.im);
                buf[data_offset..data_offset + 3].copy_from_slice(&i_bytes);
                buf[data_offset + 3..data_offset + 6].copy_from_slice(&q_bytes);
                data_offset += 6;
            }
            buf[data_offset] = 0;
            buf[data_offset + 1] = 0;
            data_offset += 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::HardwareProfile;

    async fn fresh_server(nddc: u8) -> Rc<Protocol1> {
        let state = Rc::new(RefCell::new(RadioState::new(
            HardwareProfile::HERMESLITE,
            [0, 1, 2, 3, 4, 5],
            48_000,
            nddc,
        )));
        let siggen = Rc::new(RefCell::new(SignalGenerator::new(48_000, 1000.0, 0.0)));
        let socket = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        Rc::new(Protocol1 {
            socket: Rc::new(socket),
            state,
            siggen,
            echo: None,
            client_addr: RefCell::new(None),
            control_idx: Cell::new(0),
            streaming: Cell::new(false),
        })
    }

    #[tokio::test(flavor = "current_thread")]
    async fn discovery_response_carries_mac_and_board_code() {
        let server = fresh_server(2).await;
        let resp = server.build_discovery_response();
        assert_eq!(resp.len(), 60);
        assert_eq!(&resp[0..2], &[0xEF, 0xFE]);
        assert_eq!(&resp[3..9], &[0, 1, 2, 3, 4, 5]);
        assert_eq!(resp[10], HardwareProfile::HERMESLITE.code);
        assert_eq!(resp[20], 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn process_control_updates_tx_frequency() {
        let server = fresh_server(1).await;
        server.process_control(0x02, 0x00, 0x6B, 0xCA, 0x00); // 0x006BCA00 = 7,070,976
        assert_eq!(server.state.borrow().tx_frequency, 0x006B_CA00);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn process_control_sets_mox_and_sample_rate() {
        let server = fresh_server(1).await;
        server.process_control(0x01, 0x02, 0x00, 0x00, 0x00); // MOX set, rate code 2 = 192kHz
        let s = server.state.borrow();
        assert!(s.ptt);
        assert_eq!(s.sample_rate, 192_000);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn fill_subframe_rotates_response_address_each_call() {
        let server = fresh_server(1).await;
        let mut a = vec![0u8; SUBFRAME_SIZE];
        let mut b = vec![0u8; SUBFRAME_SIZE];
        server.fill_subframe(&mut a, 0);
        server.fill_subframe(&mut b, 0);
        assert_ne!(a[3] & 0xFE & !0x80, b[3] & 0xFE & !0x80);
    }
}
