#![forbid(unsafe_code)]

use bytes::Bytes;
use decoy_core::{
    Blacklist, BloomFilter, ControlTarget, DetectorRegistry, DetectorSettings, Emit, FlowKey,
    FlowState, NotificationSettings, ProtocolKind, SeenFlowNotice, SentinelDetector,
    SentinelFilter, build_notification_packet,
};
use packet_parser::{parse_ipv4_packet, parse_udp_datagram};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

const SYN: u8 = 0x02;
const ACK: u8 = 0x10;
const PSH_ACK: u8 = 0x18;
const ISN: u32 = 1000;
const SERVER_ISN: u32 = 5000;

fn client() -> (Ipv4Addr, u16) {
    (Ipv4Addr::new(10, 1, 1, 10), 40000)
}

fn decoy(port: u16) -> (Ipv4Addr, u16) {
    (Ipv4Addr::new(192, 0, 2, 20), port)
}

fn flow(port: u16) -> FlowKey {
    FlowKey::new(client().0, client().1, decoy(port).0, port)
}

fn tcp_packet(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    options: &[u8],
    payload: &[u8],
) -> Bytes {
    assert_eq!(options.len() % 4, 0);
    let tcp_len = 20 + options.len();
    let total = 20 + tcp_len + payload.len();
    let mut buf = vec![
        0x45,
        0x00,
        (total >> 8) as u8,
        total as u8,
        0x00,
        0x2a,
        0x40,
        0x00,
        0x40,
        0x06,
        0x00,
        0x00,
    ];
    buf.extend_from_slice(&src.0.octets());
    buf.extend_from_slice(&dst.0.octets());
    buf.extend_from_slice(&src.1.to_be_bytes());
    buf.extend_from_slice(&dst.1.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf.push(((tcp_len / 4) as u8) << 4);
    buf.push(flags);
    buf.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    buf.extend_from_slice(options);
    buf.extend_from_slice(payload);
    Bytes::from(buf)
}

fn client_pkt(port: u16, seq: u32, flags: u8, payload: &[u8]) -> Bytes {
    tcp_packet(client(), decoy(port), seq, 0, flags, &[], payload)
}

fn server_pkt(port: u16, seq: u32, ack: u32, flags: u8, options: &[u8], payload: &[u8]) -> Bytes {
    tcp_packet(decoy(port), client(), seq, ack, flags, options, payload)
}

/// SYN, SYN-ACK, ACK with the given options on each side.
fn handshake(detector: &mut SentinelDetector, port: u16) {
    let syn = tcp_packet(client(), decoy(port), ISN, 0, SYN, &[2, 4, 5, 0xb4], &[]);
    assert_eq!(detector.push_client(syn.clone()), vec![Emit::Pass(syn)]);
    let syn_ack = server_pkt(port, SERVER_ISN, ISN + 1, SYN | ACK, &[1, 1, 4, 2], &[]);
    assert_eq!(detector.push_server(syn_ack.clone()), vec![Emit::Pass(syn_ack)]);
    let ack = client_pkt(port, ISN + 1, ACK, &[]);
    assert_eq!(detector.push_client(ack.clone()), vec![Emit::Pass(ack)]);
    assert_eq!(state(detector, port), Some(FlowState::Sentinel));
}

fn state(detector: &SentinelDetector, port: u16) -> Option<FlowState> {
    detector.table().get(&flow(port)).map(|e| e.state())
}

fn fixed_detector(literal: Option<&str>) -> SentinelDetector {
    let settings = DetectorSettings {
        sentinel: literal.map(str::to_string),
        ..DetectorSettings::for_kind(ProtocolKind::Fixed)
    };
    SentinelDetector::new(settings, None)
}

fn filter_with(values: &[&[u8]]) -> Arc<dyn SentinelFilter> {
    let mut filter = BloomFilter::with_params(16, vec![11, 22, 33]).unwrap();
    for value in values {
        filter.insert(value);
    }
    Arc::new(filter)
}

fn redirected(emits: &[Emit]) -> Option<&decoy_core::RedirectedFlow> {
    emits.iter().find_map(|emit| match emit {
        Emit::RedirectFlow(flow) => Some(flow),
        _ => None,
    })
}

fn passes(emits: &[Emit]) -> bool {
    emits.iter().any(|emit| matches!(emit, Emit::Pass(_)))
}

#[test]
fn literal_sentinel_redirects_single_packet() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    handshake(&mut detector, 6881);

    let data = client_pkt(6881, ISN + 1, PSH_ACK, b"TUNNELMEL handshake");
    let emits = detector.push_client(data.clone());
    assert_eq!(emits.len(), 1);
    assert!(!passes(&emits));
    let flow_msg = redirected(&emits).expect("redirect");
    assert_eq!(flow_msg.packets, vec![data]);
    assert_eq!(flow_msg.syn_options, Bytes::from_static(&[2, 4, 5, 0xb4]));
    assert_eq!(flow_msg.ack_options, Bytes::from_static(&[1, 1, 4, 2]));
    assert_eq!(state(&detector, 6881), Some(FlowState::Redirect));

    let later = client_pkt(6881, ISN + 20, PSH_ACK, b"more");
    assert_eq!(detector.push_client(later.clone()), vec![Emit::Redirect(later)]);
    assert_eq!(detector.stats().redirected, 1);
}

#[test]
fn blacklisted_decoy_is_never_redirected() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    detector.install_blacklist(Arc::new(Blacklist::parse("192.0.2.0 255.255.255.0\n")));
    handshake(&mut detector, 6881);

    let data = client_pkt(6881, ISN + 1, PSH_ACK, b"TUNNELMEL handshake");
    assert_eq!(detector.push_client(data.clone()), vec![Emit::Pass(data)]);
    assert_eq!(state(&detector, 6881), None);
    assert_eq!(detector.stats().rejected, 1);
}

#[test]
fn no_filter_means_no_match() {
    let mut detector = fixed_detector(None);
    handshake(&mut detector, 6881);
    let data = client_pkt(6881, ISN + 1, PSH_ACK, b"abcdefgh");
    assert_eq!(detector.push_client(data.clone()), vec![Emit::Pass(data)]);
    assert_eq!(state(&detector, 6881), None);
}

#[test]
fn filter_membership_confirms() {
    let mut detector = fixed_detector(None);
    detector.install_filter(Some(filter_with(&[b"abcdefgh"])));
    handshake(&mut detector, 6881);
    let data = client_pkt(6881, ISN + 1, PSH_ACK, b"abcdefgh-payload");
    assert!(redirected(&detector.push_client(data)).is_some());
}

#[test]
fn http_cookie_split_across_packets() {
    let sentinel = [0x0f, 0x1e, 0x2d, 0x3c, 0x4b, 0x5a, 0x69, 0x78];
    let hex = utils::bytes_to_hex(&sentinel);
    let request = format!("GET /x HTTP/1.1\r\nCookie: a=1; sid={hex}\r\n\r\n");
    let request = request.as_bytes();
    let split = request.len() - 12;

    let mut detector = SentinelDetector::new(DetectorSettings::for_kind(ProtocolKind::Http), None);
    detector.install_filter(Some(filter_with(&[&sentinel])));
    handshake(&mut detector, 80);

    let first = client_pkt(80, ISN + 1, PSH_ACK, &request[..split]);
    assert_eq!(detector.push_client(first.clone()), vec![Emit::Pass(first.clone())]);
    assert_eq!(state(&detector, 80), Some(FlowState::Segment));

    let second = client_pkt(80, ISN + 1 + split as u32, PSH_ACK, &request[split..]);
    let emits = detector.push_client(second.clone());
    assert!(!passes(&emits));
    let flow_msg = redirected(&emits).expect("redirect");
    assert_eq!(flow_msg.packets, vec![first, second]);
    assert_eq!(state(&detector, 80), Some(FlowState::Redirect));
}

#[test]
fn http_rejects_invalid_hex_and_non_get() {
    let mut detector = SentinelDetector::new(DetectorSettings::for_kind(ProtocolKind::Http), None);
    detector.install_filter(Some(filter_with(&[b"whatever"])));
    handshake(&mut detector, 80);
    let bad_hex = client_pkt(
        80,
        ISN + 1,
        PSH_ACK,
        b"GET / HTTP/1.1\r\nCookie: s=zz112233445566778\r\n\r\n",
    );
    assert_eq!(detector.push_client(bad_hex.clone()), vec![Emit::Pass(bad_hex)]);
    assert_eq!(state(&detector, 80), None);

    handshake(&mut detector, 80);
    let post = client_pkt(80, ISN + 1, PSH_ACK, b"POST / HTTP/1.1\r\n");
    assert_eq!(detector.push_client(post.clone()), vec![Emit::Pass(post)]);
    assert_eq!(state(&detector, 80), None);
}

fn client_hello(random: &[u8; 32]) -> Vec<u8> {
    let mut hello = vec![0x16, 0x03, 0x01, 0x00, 0xc8, 0x01, 0x00, 0x00, 0xc4, 0x03, 0x03];
    hello.extend_from_slice(random);
    hello.extend_from_slice(&[0x00, 0x00, 0x02, 0x13, 0x01, 0x01, 0x00]);
    hello
}

#[test]
fn tls_hello_redirect_and_server_hello() {
    let mut random = [0u8; 32];
    random[4..12].copy_from_slice(b"sentinel");
    let settings = DetectorSettings {
        mirror_reverse: true,
        ..DetectorSettings::for_kind(ProtocolKind::Tls)
    };
    let mut detector = SentinelDetector::new(settings, None);
    detector.install_filter(Some(filter_with(&[b"sentinel"])));
    handshake(&mut detector, 443);

    let hello = client_pkt(443, ISN + 1, PSH_ACK, &client_hello(&random));
    assert!(redirected(&detector.push_client(hello)).is_some());

    let mut server_hello = client_hello(&[7u8; 32]);
    server_hello[5] = 0x02;
    let reply = server_pkt(443, SERVER_ISN + 1, ISN + 1, PSH_ACK, &[], &server_hello);
    let emits = detector.push_server(reply.clone());
    assert_eq!(
        emits,
        vec![
            Emit::TlsEstablished {
                flow: flow(443),
                random: Bytes::from(vec![7u8; 28]),
            },
            Emit::Redirect(reply.clone()),
        ]
    );
    // Only the first ServerHello counts.
    assert_eq!(detector.push_server(reply.clone()), vec![Emit::Redirect(reply)]);
    assert!(detector.table().get(&flow(443)).unwrap().proto_ack());
}

#[test]
fn tls_non_hello_is_rejected() {
    let mut detector = SentinelDetector::new(DetectorSettings::for_kind(ProtocolKind::Tls), None);
    detector.install_filter(Some(filter_with(&[b"sentinel"])));
    handshake(&mut detector, 443);
    let data = client_pkt(443, ISN + 1, PSH_ACK, &[0x17, 0x03, 0x03, 0x00, 0x20, 0x00, 0x01]);
    assert_eq!(detector.push_client(data.clone()), vec![Emit::Pass(data)]);
    assert_eq!(state(&detector, 443), None);
}

#[test]
fn invalid_client_ack_removes_flow() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    let syn = client_pkt(6881, ISN, SYN, &[]);
    detector.push_client(syn);
    let bad_ack = client_pkt(6881, ISN + 7, ACK, &[]);
    assert_eq!(detector.push_client(bad_ack.clone()), vec![Emit::Pass(bad_ack)]);
    assert_eq!(state(&detector, 6881), None);
}

#[test]
fn other_ports_pass_untouched() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    let syn = client_pkt(22, ISN, SYN, &[]);
    assert_eq!(detector.push_client(syn.clone()), vec![Emit::Pass(syn)]);
    assert!(detector.table().is_empty());
}

#[test]
fn byte_wise_segments_reach_the_same_decision() {
    let payload = b"abcdefgh and then the rest";
    for confirmed in [true, false] {
        let mut detector = fixed_detector(None);
        let member: &[u8] = if confirmed { b"abcdefgh" } else { b"zzzzzzzz" };
        detector.install_filter(Some(filter_with(&[member])));
        handshake(&mut detector, 6881);

        let mut last = Vec::new();
        for (i, byte) in payload[..8].iter().enumerate() {
            let pkt = client_pkt(6881, ISN + 1 + i as u32, PSH_ACK, &[*byte]);
            last = detector.push_client(pkt);
        }
        assert_eq!(redirected(&last).is_some(), confirmed);
        if confirmed {
            assert_eq!(redirected(&last).unwrap().packets.len(), 8);
            assert!(!passes(&last));
        } else {
            assert_eq!(state(&detector, 6881), None);
        }
    }
}

#[test]
fn out_of_order_segments_wait_for_gap() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    handshake(&mut detector, 6881);

    let tail = client_pkt(6881, ISN + 5, PSH_ACK, b"ELME");
    assert_eq!(detector.push_client(tail.clone()), vec![Emit::Pass(tail.clone())]);
    assert_eq!(state(&detector, 6881), Some(FlowState::Segment));

    let head = client_pkt(6881, ISN + 1, PSH_ACK, b"TUNN");
    let emits = detector.push_client(head.clone());
    assert_eq!(redirected(&emits).unwrap().packets, vec![head, tail]);
}

#[test]
fn pure_ack_in_segment_state_is_not_buffered() {
    let mut detector = fixed_detector(Some("TUNNELME"));
    handshake(&mut detector, 6881);
    detector.push_client(client_pkt(6881, ISN + 1, PSH_ACK, b"CUR"));
    let dup_ack = client_pkt(6881, ISN + 4, ACK, &[]);
    assert_eq!(detector.push_client(dup_ack.clone()), vec![Emit::Pass(dup_ack)]);
    assert_eq!(detector.table().get(&flow(6881)).unwrap().buffered_bytes(), 3);
}

#[test]
fn reassembly_limit_rejects_flow() {
    let settings = DetectorSettings {
        max_buffered_bytes: 16,
        ..DetectorSettings::for_kind(ProtocolKind::Http)
    };
    let mut detector = SentinelDetector::new(settings, None);
    handshake(&mut detector, 80);
    detector.push_client(client_pkt(80, ISN + 1, PSH_ACK, b"GET /aaaaaaaa"));
    let more = client_pkt(80, ISN + 14, PSH_ACK, b"bbbbbbbb");
    assert_eq!(detector.push_client(more.clone()), vec![Emit::Pass(more)]);
    assert_eq!(state(&detector, 80), None);
}

#[test]
fn seen_flow_defers_to_peer() {
    let mut detector = fixed_detector(None);
    detector.install_filter(Some(filter_with(&[b"abcdefgh"])));
    detector.record_seen(&SeenFlowNotice {
        flow: flow(6881),
        sentinel: Bytes::from_static(b"abcdefgh"),
    });
    handshake(&mut detector, 6881);
    let data = client_pkt(6881, ISN + 1, PSH_ACK, b"abcdefgh");
    assert_eq!(detector.push_client(data.clone()), vec![Emit::Pass(data)]);
    assert_eq!(state(&detector, 6881), None);
}

#[test]
fn confirmed_flow_sends_notification() {
    let notification = NotificationSettings {
        port: 4000,
        local_addr: Ipv4Addr::new(10, 0, 0, 1),
    };
    let mut detector = SentinelDetector::new(
        DetectorSettings::for_kind(ProtocolKind::Fixed),
        Some(notification),
    );
    detector.install_filter(Some(filter_with(&[b"abcdefgh"])));
    handshake(&mut detector, 6881);
    let emits = detector.push_client(client_pkt(6881, ISN + 1, PSH_ACK, b"abcdefghij"));
    let Some(Emit::Notify(packet)) = emits.first() else {
        panic!("expected notification first, got {emits:?}");
    };
    let ipv4 = parse_ipv4_packet(packet).unwrap();
    assert_eq!(ipv4.destination_addr(), decoy(6881).0);
    assert_eq!(ipv4.identification, 0x2a);
    let udp = parse_udp_datagram(ipv4.payload).unwrap();
    let notice = SeenFlowNotice::decode(udp.payload).unwrap();
    assert_eq!(notice.flow, flow(6881));
    assert_eq!(notice.sentinel, Bytes::from_static(b"abcdefgh"));
    assert!(redirected(&emits).is_some());
}

#[test]
fn idle_flows_are_swept_after_two_intervals() {
    let settings = DetectorSettings {
        sweep_interval_secs: 10,
        ..DetectorSettings::for_kind(ProtocolKind::Fixed)
    };
    let mut detector = SentinelDetector::new(settings, None);
    let start = Instant::now();
    assert_eq!(detector.poll_sweep(start), 0);
    detector.push_client(client_pkt(6881, ISN, SYN, &[]));

    assert_eq!(detector.poll_sweep(start + Duration::from_secs(5)), 0);
    assert_eq!(detector.poll_sweep(start + Duration::from_secs(10)), 0);
    assert_eq!(state(&detector, 6881), Some(FlowState::Ack));
    assert_eq!(detector.poll_sweep(start + Duration::from_secs(20)), 1);
    assert_eq!(detector.stats().evicted, 1);
}

fn registry() -> DetectorRegistry {
    let notification = NotificationSettings {
        port: 4000,
        local_addr: Ipv4Addr::new(10, 0, 0, 1),
    };
    let mut registry = DetectorRegistry::new(Some(notification));
    for kind in [ProtocolKind::Fixed, ProtocolKind::Http, ProtocolKind::Tls] {
        let settings = DetectorSettings {
            sentinel: Some("TUNNELME".into()),
            ..DetectorSettings::for_kind(kind)
        };
        registry.register(SentinelDetector::new(settings, Some(notification)));
    }
    registry
}

#[test]
fn registry_routes_by_port_and_removes_flows() {
    let mut registry = registry();
    registry.process(client_pkt(6881, ISN, SYN, &[]));
    registry.process(client_pkt(443, ISN, SYN, &[]));
    assert!(registry.detector(ProtocolKind::Fixed).unwrap().table().contains(&flow(6881)));
    assert!(registry.detector(ProtocolKind::Tls).unwrap().table().contains(&flow(443)));
    assert!(registry.detector(ProtocolKind::Http).unwrap().table().is_empty());

    assert_eq!(registry.remove_flow(&flow(443)), 1);
    assert_eq!(registry.remove_flow(&flow(443)), 0);
}

#[test]
fn registry_accepts_peer_notifications() {
    let mut registry = registry();
    let peer = NotificationSettings {
        port: 4000,
        local_addr: Ipv4Addr::new(10, 0, 0, 2),
    };
    let notice = SeenFlowNotice {
        flow: flow(6881),
        sentinel: Bytes::from_static(b"TUNNELME"),
    };
    let packet = build_notification_packet(&peer, &notice, 1, 64).unwrap();
    assert_eq!(registry.process(packet.clone()), vec![Emit::Pass(packet)]);
    for detector in registry.detectors() {
        assert!(detector.seen_flows().matches(&flow(6881), b"TUNNELME"));
    }

    // Our own notification looping back is dropped.
    let own = build_notification_packet(registry.notification().unwrap(), &notice, 1, 64).unwrap();
    assert!(registry.process(own).is_empty());
}

#[test]
fn registry_claims_icmp_for_redirected_flows() {
    let mut registry = registry();
    for pkt in [
        client_pkt(6881, ISN, SYN, &[]),
        client_pkt(6881, ISN + 1, ACK, &[]),
        client_pkt(6881, ISN + 1, PSH_ACK, b"TUNNELME"),
    ] {
        registry.process(pkt);
    }
    assert!(registry.detector(ProtocolKind::Fixed).unwrap().is_redirected(&flow(6881)));

    // Router on the path reports a packet the decoy sent to the client.
    let icmp = icmp_error(decoy(6881), client());
    let emits = registry.process(icmp.clone());
    assert_eq!(
        emits,
        vec![Emit::RedirectIcmp {
            flow: flow(6881).reverse(),
            packet: icmp,
            to_client: true,
        }]
    );

    let unrelated = icmp_error((Ipv4Addr::new(8, 8, 8, 8), 53), client());
    assert_eq!(registry.process(unrelated.clone()), vec![Emit::Pass(unrelated)]);
}

fn icmp_error(quoted_src: (Ipv4Addr, u16), quoted_dst: (Ipv4Addr, u16)) -> Bytes {
    let quoted = tcp_packet(quoted_src, quoted_dst, 1, 1, ACK, &[], &[]);
    let total = 20 + 8 + quoted.len();
    let mut packet = vec![
        0x45,
        0x00,
        (total >> 8) as u8,
        total as u8,
        0,
        0,
        0,
        0,
        64,
        1,
        0,
        0,
    ];
    packet.extend_from_slice(&[10, 200, 0, 1]);
    packet.extend_from_slice(&quoted_dst.0.octets());
    packet.extend_from_slice(&[11, 0, 0, 0, 0, 0, 0, 0]);
    packet.extend_from_slice(&quoted);
    Bytes::from(packet)
}
