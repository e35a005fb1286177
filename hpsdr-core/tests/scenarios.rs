//! End-to-end wire-protocol scenarios driven over real loopback UDP sockets,
//! matching the module design's Scenario 1-6 conformance tests.
//!
//! Both protocol engines bind real, hardcoded ports (hosts rely on exact port
//! numbers for stream demultiplexing), so these scenarios run sequentially
//! inside one `tokio::test` rather than as independent test functions, to
//! avoid two test threads racing to bind the same UDP port.

use std::cell::RefCell;
use std::f64::consts::TAU;
use std::rc::Rc;
use std::time::Duration;

use hpsdr_core::protocol1::Protocol1;
use hpsdr_core::protocol2::{self, Protocol2};
use hpsdr_core::{EchoBuffer, HardwareProfile, RadioState, SignalGenerator};
use tokio::net::UdpSocket;
use tokio::task::LocalSet;

fn fresh_radio(sample_rate: u32, nddc: u8) -> (Rc<RefCell<RadioState>>, Rc<RefCell<SignalGenerator>>) {
    let state = Rc::new(RefCell::new(RadioState::new(
        HardwareProfile::HERMESLITE,
        [0x02, 0x11, 0x22, 0x33, 0x44, 0x55],
        sample_rate,
        nddc,
    )));
    let siggen = Rc::new(RefCell::new(SignalGenerator::new(sample_rate, 1000.0, 0.0)));
    (state, siggen)
}

async fn recv_with_timeout(socket: &UdpSocket, buf: &mut [u8]) -> (usize, std::net::SocketAddr) {
    tokio::time::timeout(Duration::from_millis(500), socket.recv_from(buf))
        .await
        .expect("datagram did not arrive in time")
        .expect("recv_from failed")
}

#[tokio::test(flavor = "current_thread")]
async fn wire_protocol_scenarios() {
    let local = LocalSet::new();
    local
        .run_until(async {
            p1_scenarios().await;
            p2_scenarios().await;
        })
        .await;
}

async fn p1_scenarios() {
    let (state, siggen) = fresh_radio(48_000, 2);
    let echo = Rc::new(RefCell::new(EchoBuffer::new(48_000)));
    let engine = Protocol1::bind(state.clone(), siggen.clone(), Some(echo.clone()))
        .await
        .expect("bind P1");
    let handle = tokio::task::spawn_local(Rc::clone(&engine).run());

    let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let radio_addr: std::net::SocketAddr = "127.0.0.1:1024".parse().unwrap();

    // Scenario 1: discovery.
    let mut discovery_req = vec![0u8; 60];
    discovery_req[0] = 0xEF;
    discovery_req[1] = 0xFE;
    discovery_req[2] = 0x02;
    client.send_to(&discovery_req, radio_addr).await.unwrap();
    let mut buf = [0u8; 256];
    let (n, _) = recv_with_timeout(&client, &mut buf).await;
    assert_eq!(n, 60);
    assert_eq!(&buf[0..3], &[0xEF, 0xFE, 0x02]);
    assert_eq!(&buf[3..9], &[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]);
    assert_eq!(buf[9], 25); // firmware
    assert_eq!(buf[10], HardwareProfile::HERMESLITE.code);
    assert_eq!(buf[20], 2); // nddc

    // Start streaming.
    client
        .send_to(&[0xEF, 0xFE, 0x04, 0x01], radio_addr)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Scenario 2: sample-rate change via a host data packet, addr 0x00, rate code 1 (96k).
    let mut rate_pkt = vec![0u8; 1032];
    rate_pkt[0] = 0xEF;
    rate_pkt[1] = 0xFE;
    rate_pkt[2] = 0x01;
    for off in [8usize, 520] {
        rate_pkt[off] = 0x7F;
        rate_pkt[off + 1] = 0x7F;
        rate_pkt[off + 2] = 0x7F;
        rate_pkt[off + 3] = 0x00; // C0: addr 0, MOX 0
        rate_pkt[off + 4] = 0x01; // C1: rate code 1 -> 96kHz
    }
    client.send_to(&rate_pkt, radio_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.borrow().sample_rate, 96_000);

    // Scenario 3: PTT on, feed a 1kHz sinusoid in the I/Q fields, PTT off, check echo.
    let tx_freq = 7_100_000u32;
    state.borrow_mut().tx_frequency = tx_freq;

    let mut ptt_on = vec![0u8; 1032];
    ptt_on[0] = 0xEF;
    ptt_on[1] = 0xFE;
    ptt_on[2] = 0x01;
    for off in [8usize, 520] {
        ptt_on[off] = 0x7F;
        ptt_on[off + 1] = 0x7F;
        ptt_on[off + 2] = 0x7F;
        ptt_on[off + 3] = 0x03; // addr 0, MOX 1
    }
    client.send_to(&ptt_on, radio_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(state.borrow().ptt);

    for frame in 0..2usize {
        let mut data_pkt = vec![0u8; 1032];
        data_pkt[0] = 0xEF;
        data_pkt[1] = 0xFE;
        data_pkt[2] = 0x01;
        for (sub, off) in [8usize, 520].into_iter().enumerate() {
            data_pkt[off] = 0x7F;
            data_pkt[off + 1] = 0x7F;
            data_pkt[off + 2] = 0x7F;
            data_pkt[off + 3] = 0x03; // keep MOX 1
            for row in 0..63usize {
                let k = (frame * 2 + sub) * 63 + row;
                let phase = TAU * 1000.0 * (k as f64) / 48_000.0;
                let i = (phase.cos() * 20_000.0) as i16;
                let q = (phase.sin() * 20_000.0) as i16;
                let block_off = off + 8 + row * 8;
                data_pkt[block_off + 4..block_off + 6].copy_from_slice(&i.to_be_bytes());
                data_pkt[block_off + 6..block_off + 8].copy_from_slice(&q.to_be_bytes());
            }
        }
        client.send_to(&data_pkt, radio_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let mut ptt_off = vec![0u8; 1032];
    ptt_off[0] = 0xEF;
    ptt_off[1] = 0xFE;
    ptt_off[2] = 0x01;
    for off in [8usize, 520] {
        ptt_off[off] = 0x7F;
        ptt_off[off + 1] = 0x7F;
        ptt_off[off + 2] = 0x7F;
        ptt_off[off + 3] = 0x00; // addr 0, MOX 0
    }
    client.send_to(&ptt_off, radio_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!state.borrow().ptt);
    assert!(echo.borrow().has_echoes());

    let played = echo.borrow_mut().generate_echo(256, tx_freq, 48_000);
    let avg_mag: f64 = played.iter().map(|s| s.norm()).sum::<f64>() / played.len() as f64;
    assert!(avg_mag > 0.0, "echo playback should not be silent");
    assert!(avg_mag < 1.0, "echo playback must be attenuated");

    handle.abort();
    let _ = handle.await;
}

async fn p2_scenarios() {
    let (state, siggen) = fresh_radio(192_000, 2);
    let engine = Protocol2::bind(state.clone(), siggen.clone(), None)
        .await
        .expect("bind P2");
    let handle = tokio::task::spawn_local(Rc::clone(&engine).run());

    let client = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let hp_addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", protocol2::PORT_HIGH_PRIORITY).parse().unwrap();

    // Scenario 4/5: RUN on, expect HP status (source port 1025) and DDC0 IQ
    // (source port 1035) datagrams within 150ms.
    let mut run_on = vec![0u8; 400];
    run_on[4] = 0x01; // RUN bit set, PTT clear
    client.send_to(&run_on, hp_addr).await.unwrap();

    let mut saw_hp_status = false;
    let mut ddc0_packets: Vec<Vec<u8>> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
    let mut buf = [0u8; 2048];
    while tokio::time::Instant::now() < deadline && (!saw_hp_status || ddc0_packets.len() < 2) {
        let Ok(Ok((n, from))) =
            tokio::time::timeout(Duration::from_millis(150), client.recv_from(&mut buf)).await
        else {
            break;
        };
        if from.port() == protocol2::PORT_HP_STATUS {
            saw_hp_status = true;
        } else if from.port() == protocol2::PORT_DDC_BASE {
            ddc0_packets.push(buf[..n].to_vec());
        }
    }
    assert!(saw_hp_status, "expected at least one HP status datagram");
    assert!(ddc0_packets.len() >= 2, "expected at least two DDC0 IQ datagrams");

    // Scenario 5: DDC IQ packet shape.
    let pkt = &ddc0_packets[0];
    assert_eq!(pkt.len(), 1444);
    assert_eq!(&pkt[12..14], &[0x00, 0x18]); // 24 bits per sample
    assert_eq!(&pkt[14..16], &[0x00, 0xEE]); // 238 samples/frame
    let seq0 = u32::from_be_bytes(pkt[0..4].try_into().unwrap());
    let seq1 = u32::from_be_bytes(ddc0_packets[1][0..4].try_into().unwrap());
    assert_eq!(seq1, seq0.wrapping_add(1));

    // RUN off: no further DDC IQ datagrams after a quiesce.
    let mut run_off = vec![0u8; 400];
    run_off[4] = 0x00;
    client.send_to(&run_off, hp_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let drained = tokio::time::timeout(Duration::from_millis(50), client.recv_from(&mut buf)).await;
    assert!(drained.is_err(), "no datagrams should arrive once streaming is stopped");

    handle.abort();
    let _ = handle.await;

    // Scenario 6: TX-idle timeout commits an echo recording even while PTT stays on.
    let (state2, siggen2) = fresh_radio(192_000, 2);
    let echo = Rc::new(RefCell::new(EchoBuffer::new(192_000)));
    let engine2 = Protocol2::bind(state2.clone(), siggen2.clone(), Some(echo.clone()))
        .await
        .expect("bind P2 (echo)");
    let handle2 = tokio::task::spawn_local(Rc::clone(&engine2).run());

    let mut ptt_on = vec![0u8; 400];
    ptt_on[4] = 0x02; // PTT bit, RUN clear
    client.send_to(&ptt_on, hp_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(state2.borrow().ptt);

    let tx_iq_addr: std::net::SocketAddr =
        format!("127.0.0.1:{}", protocol2::PORT_TX_IQ).parse().unwrap();
    let mut tx_pkt = vec![0u8; 4 + 6 * 100];
    for k in 0..100usize {
        let phase = TAU * 1000.0 * (k as f64) / 192_000.0;
        let sample = num_complex::Complex64::from_polar(0.5, phase);
        let i = (sample.re * 8_388_607.0) as i32 & 0x00FF_FFFF;
        let q = (sample.im * 8_388_607.0) as i32 & 0x00FF_FFFF;
        let off = 4 + k * 6;
        tx_pkt[off] = ((i >> 16) & 0xFF) as u8;
        tx_pkt[off + 1] = ((i >> 8) & 0xFF) as u8;
        tx_pkt[off + 2] = (i & 0xFF) as u8;
        tx_pkt[off + 3] = ((q >> 16) & 0xFF) as u8;
        tx_pkt[off + 4] = ((q >> 8) & 0xFF) as u8;
        tx_pkt[off + 5] = (q & 0xFF) as u8;
    }
    client.send_to(&tx_pkt, tx_iq_addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!echo.borrow().has_echoes(), "commit should not happen before the idle timeout");

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(state2.borrow().ptt, "PTT must remain on through the timeout");
    assert!(echo.borrow().has_echoes(), "TX-idle timeout should have committed a recording");

    handle2.abort();
    let _ = handle2.await;
}
