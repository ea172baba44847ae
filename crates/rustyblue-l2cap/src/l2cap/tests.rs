//! Tests for the L2CAP implementation

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::core::*;
    use super::super::packet::*;
    use super::super::psm::*;
    use super::super::signaling::*;
    use super::super::types::*;
    use super::super::*;
    use crate::config::L2capConfig;
    use crate::error::{HciError, L2capError};
    use crate::hci::{ConnectionHandle, HciTransport};
    use rand::Rng;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    const HANDLE: ConnectionHandle = 0x0042;
    const PSM: Psm = Psm(0x1001);
    const PEER_CID: ChannelId = 0x0070;

    fn local() -> BdAddr {
        "00:1A:7D:DA:71:01".parse().unwrap()
    }

    fn remote() -> BdAddr {
        "00:1A:7D:DA:71:02".parse().unwrap()
    }

    #[derive(Debug, Clone)]
    struct Sent {
        data: Vec<u8>,
        is_start: bool,
        priority: u8,
    }

    /// Records every request the engine makes of the baseband
    #[derive(Default)]
    struct MockTransport {
        connects: Mutex<Vec<(BdAddr, BdAddr)>>,
        disconnects: Mutex<Vec<(ConnectionHandle, u8)>>,
        sent: Mutex<Vec<Sent>>,
    }

    impl HciTransport for MockTransport {
        fn connect(&self, local: BdAddr, remote: BdAddr) -> Result<(), HciError> {
            self.connects.lock().unwrap().push((local, remote));
            Ok(())
        }

        fn disconnect(&self, handle: ConnectionHandle, reason: u8) -> Result<(), HciError> {
            self.disconnects.lock().unwrap().push((handle, reason));
            Ok(())
        }

        fn send(
            &self,
            _handle: ConnectionHandle,
            fragment: &[u8],
            is_start: bool,
            priority: u8,
        ) -> Result<(), HciError> {
            self.sent.lock().unwrap().push(Sent {
                data: fragment.to_vec(),
                is_start,
                priority,
            });
            Ok(())
        }
    }

    impl MockTransport {
        fn take_connects(&self) -> Vec<(BdAddr, BdAddr)> {
            std::mem::take(&mut *self.connects.lock().unwrap())
        }

        fn take_disconnects(&self) -> Vec<(ConnectionHandle, u8)> {
            std::mem::take(&mut *self.disconnects.lock().unwrap())
        }

        fn take_sent(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }

        /// Drain and decode every signaling command sent so far
        fn signals(&self) -> Vec<SignalingMessage> {
            self.take_sent()
                .iter()
                .filter_map(|sent| L2capPacket::parse(&sent.data))
                .filter(|packet| packet.header.channel_id == L2CAP_SIGNALING_CID)
                .map(|packet| SignalingMessage::parse(&packet.payload).unwrap())
                .collect()
        }
    }

    fn setup() -> (Arc<MockTransport>, L2capManager) {
        let transport = Arc::new(MockTransport::default());
        let manager = L2capManager::new(L2capConfig::default(), transport.clone());
        manager.on_interface_up(local(), 672).unwrap();
        (transport, manager)
    }

    fn feed(manager: &L2capManager, message: SignalingMessage) {
        manager.on_acl_data(HANDLE, &message.to_packet().to_bytes(), true);
    }

    fn feed_raw(manager: &L2capManager, cid: ChannelId, payload: &[u8]) {
        let frame = L2capPacket::new(cid, payload.to_vec()).to_bytes();
        manager.on_acl_data(HANDLE, &frame, true);
    }

    fn config_request(identifier: SignalId, cid: ChannelId, mtu: Option<u16>) -> SignalingMessage {
        SignalingMessage::ConfigureRequest {
            identifier,
            destination_cid: cid,
            flags: 0,
            options: ConfigOptions {
                mtu,
                ..Default::default()
            },
        }
    }

    fn config_success(identifier: SignalId, cid: ChannelId) -> SignalingMessage {
        SignalingMessage::ConfigureResponse {
            identifier,
            source_cid: cid,
            flags: 0,
            result: L2CAP_CONF_SUCCESS,
            options: ConfigOptions::default(),
        }
    }

    /// Drive an outbound channel to CONNECTED against a scripted peer
    fn open_outbound(manager: &L2capManager, transport: &MockTransport) -> L2capChannel {
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        transport.signals();

        feed(
            manager,
            SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
                result: L2CAP_CR_SUCCESS,
                status: L2CAP_CS_NO_INFO,
            },
        );
        feed(manager, config_success(2, 0x0040));
        feed(manager, config_request(50, 0x0040, None));
        transport.signals();

        assert_eq!(channel.state(), L2capChannelState::Connected);
        channel
    }

    /// Bring up an inbound link with a listener on `PSM`
    fn listening(manager: &L2capManager, backlog: usize) -> L2capChannel {
        let listener = manager.create_channel();
        manager.bind(&listener, BdAddr::ANY, PSM).unwrap();
        manager.listen(&listener, backlog).unwrap();

        assert!(manager.on_inbound_connect(local(), remote()));
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        listener
    }

    fn connection_request(identifier: SignalId, psm: Psm, source_cid: ChannelId) -> SignalingMessage {
        SignalingMessage::ConnectionRequest {
            identifier,
            psm,
            source_cid,
        }
    }

    #[test]
    fn test_psm_validity() {
        assert!(Psm::SDP.is_valid());
        assert!(Psm::RFCOMM.is_valid());
        assert!(Psm(0x1001).is_valid());
        assert!(!Psm(0x0002).is_valid()); // even
        assert!(!Psm(0x0101).is_valid()); // bit 8 set
        assert!(Psm(0x1001).is_dynamic());
        assert!(!Psm::SDP.is_dynamic());
    }

    #[test]
    fn test_l2cap_header() {
        let header = L2capHeader::new(10, 0x0040);
        assert_eq!(header.to_bytes(), [0x0A, 0x00, 0x40, 0x00]);

        let parsed = L2capHeader::parse(&header.to_bytes()).unwrap();
        assert_eq!(parsed.length, 10);
        assert_eq!(parsed.channel_id, 0x0040);
        assert!(L2capHeader::parse(&[0x0A, 0x00]).is_none());
    }

    #[test]
    fn test_l2cap_packet_length_must_match() {
        let packet = L2capPacket::new(0x0040, vec![1, 2, 3, 4]);
        let mut bytes = packet.to_bytes();
        assert_eq!(L2capPacket::parse(&bytes).unwrap().payload, vec![1, 2, 3, 4]);

        bytes.push(5);
        assert!(L2capPacket::parse(&bytes).is_none());
    }

    #[test]
    fn test_signaling_connection_request_wire_format() {
        let request = connection_request(1, Psm::SDP, 0x0040);
        assert_eq!(request.command_code(), L2CAP_CONNECTION_REQUEST);
        assert_eq!(
            request.serialize(),
            vec![0x02, 0x01, 0x04, 0x00, 0x01, 0x00, 0x40, 0x00]
        );
        assert_eq!(SignalingMessage::parse(&request.serialize()).unwrap(), request);
    }

    #[test]
    fn test_signaling_config_options() {
        let request = config_request(2, 0x0041, Some(128));
        let bytes = request.serialize();
        assert_eq!(&bytes[8..], &[L2CAP_CONF_MTU, 2, 0x80, 0x00]);

        match SignalingMessage::parse(&bytes).unwrap() {
            SignalingMessage::ConfigureRequest { options, .. } => {
                assert_eq!(options.mtu, Some(128));
                assert_eq!(options.flush_timeout, None);
            }
            other => panic!("Expected ConfigureRequest, got {:?}", other),
        }

        // unknown options are recorded with their hint bit
        let options = SignalingMessage::parse_config_options(&[0x85, 1, 0, 0x05, 1, 0]);
        assert_eq!(options.unknown, vec![0x85, 0x05]);
        assert_eq!(options.mtu, None);
    }

    #[test]
    fn test_outbound_channel_setup() {
        let (transport, manager) = setup();
        let events = manager.subscribe();

        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        assert_eq!(transport.take_connects(), vec![(local(), remote())]);
        assert_eq!(channel.state(), L2capChannelState::WaitLink);
        assert_eq!(channel.local_cid(), 0x0040);

        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        assert_eq!(channel.state(), L2capChannelState::ConnectSent);
        assert_eq!(transport.signals(), vec![connection_request(1, PSM, 0x0040)]);

        feed(
            &manager,
            SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
                result: L2CAP_CR_SUCCESS,
                status: L2CAP_CS_NO_INFO,
            },
        );
        assert_eq!(channel.state(), L2capChannelState::Config);
        assert_eq!(channel.remote_cid(), Some(PEER_CID));
        // default MTU is not proposed
        assert_eq!(transport.signals(), vec![config_request(2, PEER_CID, None)]);

        feed(&manager, config_success(2, 0x0040));
        assert_eq!(channel.config_state(), ConfigState::OUTGOING_REQUEST_SENT | ConfigState::INPUT_NEGOTIATED);

        feed(&manager, config_request(7, 0x0040, Some(500)));
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 7,
                source_cid: PEER_CID,
                flags: 0,
                result: L2CAP_CONF_SUCCESS,
                options: ConfigOptions::default(),
            }]
        );

        assert_eq!(channel.state(), L2capChannelState::Connected);
        assert_eq!(manager.get_options(&channel).out_mtu, 500);
        assert_eq!(manager.wait_connected(&channel, Some(Duration::ZERO)), Ok(()));
        assert_eq!(manager.pending_timers(), 0);

        let events: Vec<ChannelEvent> = events.try_iter().collect();
        assert_eq!(
            events,
            vec![ChannelEvent::Connected {
                channel: channel.id(),
                cid: 0x0040,
                psm: PSM,
            }]
        );
    }

    #[test]
    fn test_second_channel_reuses_link() {
        let (transport, manager) = setup();
        let first = open_outbound(&manager, &transport);
        transport.take_connects();

        let second = manager.create_channel();
        manager.connect(&second, remote(), PSM).unwrap();
        assert!(transport.take_connects().is_empty());
        assert_eq!(second.local_cid(), 0x0041);
        assert_eq!(second.state(), L2capChannelState::ConnectSent);
        assert_eq!(manager.connection_count(), 1);
        assert_ne!(first.local_cid(), second.local_cid());
    }

    #[test]
    fn test_no_route_without_interface() {
        let transport = Arc::new(MockTransport::default());
        let manager = L2capManager::new(L2capConfig::default(), transport);
        let channel = manager.create_channel();
        assert_eq!(
            manager.connect(&channel, remote(), PSM),
            Err(L2capError::HostUnreachable)
        );
        assert_eq!(channel.state(), L2capChannelState::Closed);
    }

    #[test]
    fn test_connect_rejects_invalid_psm() {
        let (_transport, manager) = setup();
        let channel = manager.create_channel();
        assert!(matches!(
            manager.connect(&channel, remote(), Psm(0x1002)),
            Err(L2capError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_peer_refuses_connection() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        transport.signals();

        // a pending response keeps the channel waiting
        feed(
            &manager,
            SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: 0,
                source_cid: 0x0040,
                result: L2CAP_CR_PENDING,
                status: 0x0002,
            },
        );
        assert_eq!(channel.state(), L2capChannelState::ConnectSent);

        feed(
            &manager,
            SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: 0,
                source_cid: 0x0040,
                result: L2CAP_CR_BAD_PSM,
                status: 0,
            },
        );
        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(
            manager.wait_connected(&channel, Some(Duration::from_millis(10))),
            Err(L2capError::ConnectionRejected(L2CAP_CR_BAD_PSM))
        );

        let disconnected = events
            .try_iter()
            .filter(|event| matches!(event, ChannelEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);
    }

    #[test]
    fn test_configure_refused_disconnects() {
        let (transport, manager) = setup();
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        feed(
            &manager,
            SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
                result: L2CAP_CR_SUCCESS,
                status: 0,
            },
        );
        transport.signals();

        feed(
            &manager,
            SignalingMessage::ConfigureResponse {
                identifier: 2,
                source_cid: 0x0040,
                flags: 0,
                result: L2CAP_CONF_UNACCEPT,
                options: ConfigOptions::default(),
            },
        );
        assert_eq!(channel.state(), L2capChannelState::DisconnectSent);
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::DisconnectionRequest {
                identifier: 3,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
            }]
        );
        assert_eq!(
            manager.wait_connected(&channel, Some(Duration::ZERO)),
            Err(L2capError::ConnectionRefused)
        );

        feed(
            &manager,
            SignalingMessage::DisconnectionResponse {
                identifier: 3,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
            },
        );
        assert_eq!(channel.state(), L2capChannelState::Closed);
    }

    #[test]
    fn test_inbound_channel_accept() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let listener = listening(&manager, 4);
        assert_eq!(manager.pending_timers(), 1); // idle link

        feed(&manager, connection_request(1, PSM, 0x0050));
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::ConnectionResponse {
                identifier: 1,
                destination_cid: 0x0040,
                source_cid: 0x0050,
                result: L2CAP_CR_SUCCESS,
                status: L2CAP_CS_NO_INFO,
            }]
        );
        assert_eq!(listener.backlog(), Some(1));
        assert!(matches!(manager.try_accept(&listener), Ok(None)));

        feed(&manager, config_request(2, 0x0040, None));
        assert_eq!(
            transport.signals(),
            vec![
                SignalingMessage::ConfigureResponse {
                    identifier: 2,
                    source_cid: 0x0050,
                    flags: 0,
                    result: L2CAP_CONF_SUCCESS,
                    options: ConfigOptions::default(),
                },
                config_request(1, 0x0050, None),
            ]
        );

        feed(&manager, config_success(1, 0x0040));
        let child = manager
            .accept(&listener, Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(child.state(), L2capChannelState::Connected);
        assert_eq!(child.psm(), PSM);
        assert_eq!(child.remote_addr(), remote());
        assert_eq!(child.remote_cid(), Some(0x0050));
        assert_eq!(listener.backlog(), Some(0));

        let events: Vec<ChannelEvent> = events.try_iter().collect();
        assert!(events.contains(&ChannelEvent::IncomingConnection {
            listener: listener.id(),
            channel: child.id(),
        }));
    }

    #[test]
    fn test_connect_request_without_listener() {
        let (transport, manager) = setup();
        let _listener = listening(&manager, 1);

        feed(&manager, connection_request(4, Psm(0x1003), 0x0050));
        feed(&manager, connection_request(5, Psm(0x1002), 0x0051));
        let results: Vec<(ChannelId, u16)> = transport
            .signals()
            .into_iter()
            .map(|message| match message {
                SignalingMessage::ConnectionResponse {
                    destination_cid,
                    result,
                    ..
                } => (destination_cid, result),
                other => panic!("Expected ConnectionResponse, got {:?}", other),
            })
            .collect();
        assert_eq!(
            results,
            vec![(L2CAP_NULL_CID, L2CAP_CR_BAD_PSM), (L2CAP_NULL_CID, L2CAP_CR_BAD_PSM)]
        );
    }

    #[test]
    fn test_backlog_full_refuses_request() {
        let (transport, manager) = setup();
        let listener = listening(&manager, 1);

        feed(&manager, connection_request(1, PSM, 0x0050));
        feed(&manager, connection_request(2, PSM, 0x0051));

        let signals = transport.signals();
        assert_eq!(signals.len(), 2);
        assert!(matches!(
            signals[1],
            SignalingMessage::ConnectionResponse {
                identifier: 2,
                destination_cid: L2CAP_NULL_CID,
                result: L2CAP_CR_NO_MEM,
                ..
            }
        ));
        assert_eq!(listener.backlog(), Some(1));
    }

    #[test]
    fn test_duplicate_source_cid_refused() {
        let (transport, manager) = setup();
        let _listener = listening(&manager, 4);

        feed(&manager, connection_request(1, PSM, 0x0050));
        feed(&manager, connection_request(2, PSM, 0x0050));

        let signals = transport.signals();
        assert!(matches!(
            signals[1],
            SignalingMessage::ConnectionResponse {
                result: L2CAP_CR_NO_MEM,
                ..
            }
        ));
    }

    #[test]
    fn test_peer_mtu_below_requirement() {
        let (transport, manager) = setup();
        let listener = manager.create_channel();
        manager.bind(&listener, BdAddr::ANY, PSM).unwrap();
        manager.set_options(&listener, 672, 1000).unwrap();
        manager.listen(&listener, 1).unwrap();
        manager.on_inbound_connect(local(), remote());
        manager.on_connect_complete(local(), remote(), 0, HANDLE);

        feed(&manager, connection_request(1, PSM, 0x0050));
        transport.signals();

        feed(&manager, config_request(2, 0x0040, Some(500)));
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 2,
                source_cid: 0x0050,
                flags: 0,
                result: L2CAP_CONF_UNACCEPT,
                options: ConfigOptions {
                    mtu: Some(1000),
                    ..Default::default()
                },
            }]
        );

        // the peer retries with an acceptable MTU
        feed(&manager, config_request(3, 0x0040, Some(1000)));
        feed(&manager, config_success(1, 0x0040));
        let child = manager.try_accept(&listener).unwrap().unwrap();
        assert_eq!(manager.get_options(&child).out_mtu, 1000);
    }

    #[test]
    fn test_configure_continuation() {
        let (transport, manager) = setup();
        let listener = listening(&manager, 1);
        feed(&manager, connection_request(1, PSM, 0x0050));
        transport.signals();

        feed(
            &manager,
            SignalingMessage::ConfigureRequest {
                identifier: 2,
                destination_cid: 0x0040,
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                options: ConfigOptions {
                    mtu: Some(500),
                    ..Default::default()
                },
            },
        );
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::ConfigureResponse {
                identifier: 2,
                source_cid: 0x0050,
                flags: L2CAP_CONF_FLAG_CONTINUATION,
                result: L2CAP_CONF_SUCCESS,
                options: ConfigOptions::default(),
            }]
        );

        feed(&manager, config_request(3, 0x0040, None));
        feed(&manager, config_success(1, 0x0040));
        let child = manager.try_accept(&listener).unwrap().unwrap();
        assert_eq!(manager.get_options(&child).out_mtu, 500);
    }

    #[test]
    fn test_echo_and_information_requests() {
        let (transport, manager) = setup();
        manager.on_inbound_connect(local(), remote());
        manager.on_connect_complete(local(), remote(), 0, HANDLE);

        feed(
            &manager,
            SignalingMessage::EchoRequest {
                identifier: 9,
                data: vec![1, 2, 3],
            },
        );
        feed(
            &manager,
            SignalingMessage::InformationRequest {
                identifier: 10,
                info_type: L2CAP_IT_FEAT_MASK,
            },
        );

        assert_eq!(
            transport.signals(),
            vec![
                SignalingMessage::EchoResponse {
                    identifier: 9,
                    data: vec![1, 2, 3],
                },
                SignalingMessage::InformationResponse {
                    identifier: 10,
                    info_type: L2CAP_IT_FEAT_MASK,
                    result: L2CAP_IR_NOT_SUPPORTED,
                    data: Vec::new(),
                },
            ]
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (transport, manager) = setup();
        manager.on_inbound_connect(local(), remote());
        manager.on_connect_complete(local(), remote(), 0, HANDLE);

        feed_raw(&manager, L2CAP_SIGNALING_CID, &[0x20, 0x03, 0x00, 0x00]);
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::CommandReject {
                identifier: 3,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: Vec::new(),
            }]
        );

        // a reject is never answered with a reject
        feed(
            &manager,
            SignalingMessage::CommandReject {
                identifier: 4,
                reason: L2CAP_REJECT_NOT_UNDERSTOOD,
                data: Vec::new(),
            },
        );
        // identifier 0 is invalid
        feed_raw(&manager, L2CAP_SIGNALING_CID, &[L2CAP_ECHO_REQUEST, 0x00, 0x00, 0x00]);
        assert!(transport.signals().is_empty());
    }

    #[test]
    fn test_invalid_cid_rejected() {
        let (transport, manager) = setup();
        manager.on_inbound_connect(local(), remote());
        manager.on_connect_complete(local(), remote(), 0, HANDLE);

        feed(&manager, config_request(5, 0x0099, None));
        feed(
            &manager,
            SignalingMessage::DisconnectionRequest {
                identifier: 6,
                destination_cid: 0x0098,
                source_cid: 0x0050,
            },
        );

        assert_eq!(
            transport.signals(),
            vec![
                SignalingMessage::CommandReject {
                    identifier: 5,
                    reason: L2CAP_REJECT_INVALID_CID,
                    data: vec![0x99, 0x00, 0x00, 0x00],
                },
                SignalingMessage::CommandReject {
                    identifier: 6,
                    reason: L2CAP_REJECT_INVALID_CID,
                    data: vec![0x98, 0x00, 0x50, 0x00],
                },
            ]
        );
    }

    #[test]
    fn test_send_and_receive_data() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let channel = open_outbound(&manager, &transport);

        manager.set_priority(&channel, 3);
        manager.send(&channel, b"ping").unwrap();
        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_start);
        assert_eq!(sent[0].priority, 3);
        assert_eq!(sent[0].data, vec![0x04, 0x00, 0x70, 0x00, b'p', b'i', b'n', b'g']);

        feed_raw(&manager, 0x0040, b"pong");
        assert_eq!(manager.try_receive(&channel), Ok(Some(b"pong".to_vec())));
        assert_eq!(manager.try_receive(&channel), Ok(None));
        assert!(events.try_iter().any(|event| event
            == ChannelEvent::DataReady {
                channel: channel.id(),
                cid: 0x0040,
                len: 4,
            }));

        // frames above the inbound MTU and for unknown CIDs are dropped
        feed_raw(&manager, 0x0040, &[0u8; 700]);
        feed_raw(&manager, 0x0055, b"lost");
        assert_eq!(manager.try_receive(&channel), Ok(None));
    }

    #[test]
    fn test_send_exceeding_mtu() {
        let (transport, manager) = setup();
        let channel = open_outbound(&manager, &transport);

        assert_eq!(
            manager.send(&channel, &[0u8; 673]),
            Err(L2capError::MtuExceeded)
        );
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_send_requires_connected_channel() {
        let (_transport, manager) = setup();
        let channel = manager.create_channel();
        assert_eq!(manager.send(&channel, b"x"), Err(L2capError::NotConnected));
        assert_eq!(manager.try_receive(&channel), Err(L2capError::NotConnected));
    }

    #[test]
    fn test_connect_timeout_then_idle_teardown() {
        let (transport, manager) = setup();
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        assert!(manager.next_timer_deadline().is_some());

        manager.process_timers(Instant::now() + Duration::from_secs(6));
        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(
            manager.wait_connected(&channel, Some(Duration::ZERO)),
            Err(L2capError::Timeout)
        );

        // the link is now idle
        assert_eq!(manager.pending_timers(), 1);
        assert!(transport.take_disconnects().is_empty());

        manager.process_timers(Instant::now() + Duration::from_secs(30));
        assert_eq!(transport.take_disconnects(), vec![(HANDLE, 0x13)]);
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.pending_timers(), 0);
    }

    #[test]
    fn test_close_sends_disconnect_once() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let channel = open_outbound(&manager, &transport);

        manager.close(&channel).unwrap();
        manager.close(&channel).unwrap();
        assert_eq!(channel.state(), L2capChannelState::DisconnectSent);
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::DisconnectionRequest {
                identifier: 3,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
            }]
        );

        feed(
            &manager,
            SignalingMessage::DisconnectionResponse {
                identifier: 3,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
            },
        );
        manager.close(&channel).unwrap();
        assert_eq!(channel.state(), L2capChannelState::Closed);

        let disconnected: Vec<ChannelEvent> = events
            .try_iter()
            .filter(|event| matches!(event, ChannelEvent::Disconnected { .. }))
            .collect();
        assert_eq!(
            disconnected,
            vec![ChannelEvent::Disconnected {
                channel: channel.id(),
                cid: 0x0040,
                psm: PSM,
                reason: None,
            }]
        );
    }

    #[test]
    fn test_disconnect_timeout_closes_channel() {
        let (transport, manager) = setup();
        let channel = open_outbound(&manager, &transport);
        manager.close(&channel).unwrap();

        manager.process_timers(Instant::now() + Duration::from_secs(6));
        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(channel.take_error(), Some(L2capError::Timeout));
    }

    #[test]
    fn test_peer_disconnect_resets_channel() {
        let (transport, manager) = setup();
        let channel = open_outbound(&manager, &transport);

        feed(
            &manager,
            SignalingMessage::DisconnectionRequest {
                identifier: 11,
                destination_cid: 0x0040,
                source_cid: PEER_CID,
            },
        );
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 11,
                destination_cid: 0x0040,
                source_cid: PEER_CID,
            }]
        );
        assert_eq!(
            manager.receive(&channel, Some(Duration::from_millis(10))),
            Err(L2capError::ConnectionReset)
        );
        assert_eq!(manager.pending_timers(), 1);
    }

    #[test]
    fn test_link_loss_reports_reason() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let channel = open_outbound(&manager, &transport);

        manager.on_disconnect(HANDLE, 0x08);
        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(manager.connection_count(), 0);
        assert!(events.try_iter().any(|event| event
            == ChannelEvent::Disconnected {
                channel: channel.id(),
                cid: 0x0040,
                psm: PSM,
                reason: Some(L2capError::Timeout),
            }));
    }

    #[test]
    fn test_interface_down_closes_channels() {
        let (transport, manager) = setup();
        let channel = open_outbound(&manager, &transport);

        manager.on_interface_down(&local());
        assert_eq!(channel.take_error(), Some(L2capError::NoDevice));
        assert_eq!(manager.connection_count(), 0);

        let again = manager.create_channel();
        assert_eq!(
            manager.connect(&again, remote(), PSM),
            Err(L2capError::HostUnreachable)
        );
    }

    #[test]
    fn test_failed_link_fails_waiting_channel() {
        let (_transport, manager) = setup();
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();

        manager.on_connect_complete(local(), remote(), 0x04, 0);
        assert_eq!(
            manager.wait_connected(&channel, Some(Duration::ZERO)),
            Err(L2capError::HostUnreachable)
        );
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_late_link_completion_is_released() {
        let (transport, manager) = setup();
        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        manager.on_interface_down(&local());
        assert_eq!(channel.take_error(), Some(L2capError::NoDevice));

        // nobody owns the link any more
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        assert_eq!(transport.take_disconnects(), vec![(HANDLE, 0x13)]);
        assert_eq!(manager.connection_count(), 0);

        manager.on_connect_complete(local(), remote(), 0x04, HANDLE);
        assert!(transport.take_disconnects().is_empty());
    }

    #[test]
    fn test_attach_cancels_idle_teardown() {
        let (transport, manager) = setup();
        assert!(manager.on_inbound_connect(local(), remote()));
        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        assert_eq!(manager.pending_timers(), 1); // idle link

        let channel = manager.create_channel();
        manager.connect(&channel, remote(), PSM).unwrap();
        assert!(transport.take_connects().is_empty());
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::ConnectionRequest {
                identifier: 1,
                psm: PSM,
                source_cid: 0x0040,
            }]
        );
        assert_eq!(manager.pending_timers(), 1); // connect timer only

        manager.process_timers(Instant::now() + Duration::from_secs(3));
        assert!(transport.take_disconnects().is_empty());
        assert_eq!(manager.connection_count(), 1);
        assert_eq!(channel.state(), L2capChannelState::ConnectSent);
    }

    #[test]
    fn test_close_crossing_peer_disconnect() {
        let (transport, manager) = setup();
        let events = manager.subscribe();
        let channel = open_outbound(&manager, &transport);

        manager.close(&channel).unwrap();
        assert_eq!(channel.state(), L2capChannelState::DisconnectSent);
        transport.signals();

        feed(
            &manager,
            SignalingMessage::DisconnectionRequest {
                identifier: 12,
                destination_cid: 0x0040,
                source_cid: PEER_CID,
            },
        );
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::DisconnectionResponse {
                identifier: 12,
                destination_cid: 0x0040,
                source_cid: PEER_CID,
            }]
        );
        assert_eq!(channel.state(), L2capChannelState::Closed);

        // the answer to our own request arrives late and is ignored
        feed(
            &manager,
            SignalingMessage::DisconnectionResponse {
                identifier: 3,
                destination_cid: PEER_CID,
                source_cid: 0x0040,
            },
        );
        assert!(transport.signals().is_empty());
        assert_eq!(manager.pending_timers(), 1); // idle link

        let disconnected = events
            .try_iter()
            .filter(|event| matches!(event, ChannelEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);
    }

    #[test]
    fn test_receive_queue_limit_drops_frames() {
        let transport = Arc::new(MockTransport::default());
        let config = L2capConfig {
            rx_queue_limit: 2,
            ..Default::default()
        };
        let manager = L2capManager::new(config, transport.clone());
        manager.on_interface_up(local(), 672).unwrap();
        let channel = open_outbound(&manager, &transport);

        feed_raw(&manager, 0x0040, b"one");
        feed_raw(&manager, 0x0040, b"two");
        feed_raw(&manager, 0x0040, b"three");
        assert_eq!(manager.try_receive(&channel), Ok(Some(b"one".to_vec())));
        assert_eq!(manager.try_receive(&channel), Ok(Some(b"two".to_vec())));
        assert_eq!(manager.try_receive(&channel), Ok(None));

        feed_raw(&manager, 0x0040, b"four");
        assert_eq!(manager.try_receive(&channel), Ok(Some(b"four".to_vec())));
    }

    #[test]
    fn test_bind_conflicts() {
        let (_transport, manager) = setup();
        let first = manager.create_channel();
        let second = manager.create_channel();
        let wildcard = manager.create_channel();

        manager.bind(&first, local(), PSM).unwrap();
        assert_eq!(manager.bind(&second, local(), PSM), Err(L2capError::AddressInUse));
        manager.bind(&wildcard, BdAddr::ANY, PSM).unwrap();
        assert_eq!(manager.bind(&first, local(), Psm(0x1003)), Err(L2capError::InvalidState));
        assert!(matches!(
            manager.bind(&second, local(), Psm(0x1002)),
            Err(L2capError::InvalidParameter(_))
        ));

        manager.close(&first).unwrap();
        assert_eq!(first.state(), L2capChannelState::Closed);
        manager.bind(&second, local(), PSM).unwrap();
    }

    #[test]
    fn test_listen_preconditions() {
        let (_transport, manager) = setup();
        let channel = manager.create_channel();
        assert_eq!(manager.listen(&channel, 1), Err(L2capError::InvalidState));

        manager.bind(&channel, local(), PSM).unwrap();
        assert!(matches!(
            manager.listen(&channel, 0),
            Err(L2capError::InvalidParameter(_))
        ));
        manager.listen(&channel, 1000).unwrap();
        assert_eq!(channel.state(), L2capChannelState::Listening);

        assert!(matches!(
            manager.set_options(&channel, 47, 672),
            Err(L2capError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_closing_listener_closes_pending_children() {
        let (transport, manager) = setup();
        let listener = listening(&manager, 2);
        feed(&manager, connection_request(1, PSM, 0x0050));
        transport.signals();

        manager.close(&listener).unwrap();
        assert_eq!(listener.state(), L2capChannelState::Closed);
        assert!(matches!(
            manager.try_accept(&listener),
            Err(L2capError::InvalidState)
        ));

        // the child was configuring, so it is disconnected
        assert_eq!(
            transport.signals(),
            vec![SignalingMessage::DisconnectionRequest {
                identifier: 1,
                destination_cid: 0x0050,
                source_cid: 0x0040,
            }]
        );
    }

    #[test]
    fn test_raw_channel_sees_signaling() {
        let (transport, manager) = setup();
        let raw = manager.open_raw();
        manager.connect_raw(&raw, remote()).unwrap();
        assert_eq!(raw.state(), L2capChannelState::WaitLink);

        manager.on_connect_complete(local(), remote(), 0, HANDLE);
        assert_eq!(raw.state(), L2capChannelState::Connected);
        assert_eq!(manager.pending_timers(), 0);

        let echo = SignalingMessage::EchoRequest {
            identifier: 200,
            data: vec![0xAB],
        };
        feed(&manager, echo.clone());
        assert_eq!(manager.try_receive(&raw), Ok(Some(echo.serialize())));
        transport.take_sent();

        manager.send(&raw, &echo.serialize()).unwrap();
        assert_eq!(transport.signals(), vec![echo]);

        manager.close(&raw).unwrap();
        assert_eq!(raw.state(), L2capChannelState::Closed);
        assert_eq!(manager.pending_timers(), 1);
    }

    #[test]
    fn test_interrupt_blocked_receive() {
        let (transport, manager) = setup();
        let manager = Arc::new(manager);
        let channel = open_outbound(&manager, &transport);

        let waiter = {
            let manager = manager.clone();
            let channel = channel.clone();
            thread::spawn(move || manager.receive(&channel, Some(Duration::from_secs(5))))
        };

        while !waiter.is_finished() {
            manager.interrupt(&channel);
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(waiter.join().unwrap(), Err(L2capError::Interrupted));
        assert_eq!(channel.state(), L2capChannelState::Connected);
    }

    #[test]
    fn test_interrupt_does_not_outlive_wait() {
        let (transport, manager) = setup();
        let channel = open_outbound(&manager, &transport);

        manager.interrupt(&channel);
        assert_eq!(
            manager.receive(&channel, Some(Duration::from_millis(20))),
            Err(L2capError::Timeout)
        );

        feed_raw(&manager, 0x0040, b"late");
        assert_eq!(manager.try_receive(&channel), Ok(Some(b"late".to_vec())));
    }

    /// Two engines wired back to back through their transports
    struct Pair {
        a: L2capManager,
        b: L2capManager,
        ta: Arc<MockTransport>,
        tb: Arc<MockTransport>,
    }

    impl Pair {
        fn new() -> Self {
            let ta = Arc::new(MockTransport::default());
            let tb = Arc::new(MockTransport::default());
            let a = L2capManager::new(L2capConfig::default(), ta.clone());
            let b = L2capManager::new(L2capConfig::default(), tb.clone());
            a.on_interface_up(local(), 672).unwrap();
            b.on_interface_up(remote(), 672).unwrap();
            Self { a, b, ta, tb }
        }

        /// Deliver everything in flight until both sides are quiet
        fn pump(&self) {
            loop {
                let mut progress = false;

                for (local, remote) in self.ta.take_connects() {
                    self.b.on_inbound_connect(remote, local);
                    self.b.on_connect_complete(remote, local, 0, HANDLE);
                    self.a.on_connect_complete(local, remote, 0, HANDLE);
                    progress = true;
                }
                for (handle, reason) in self.ta.take_disconnects() {
                    self.b.on_disconnect(handle, reason);
                    self.a.on_disconnect(handle, 0x16);
                    progress = true;
                }
                for sent in self.ta.take_sent() {
                    self.b.on_acl_data(HANDLE, &sent.data, sent.is_start);
                    progress = true;
                }
                for sent in self.tb.take_sent() {
                    self.a.on_acl_data(HANDLE, &sent.data, sent.is_start);
                    progress = true;
                }

                if !progress {
                    break;
                }
            }
        }

        fn open(&self) -> (L2capChannel, L2capChannel, L2capChannel) {
            let listener = self.b.create_channel();
            self.b.bind(&listener, BdAddr::ANY, PSM).unwrap();
            self.b.set_options(&listener, 1024, L2CAP_MIN_MTU).unwrap();
            self.b.listen(&listener, 4).unwrap();

            let channel = self.a.create_channel();
            self.a.connect(&channel, remote(), PSM).unwrap();
            self.pump();

            self.a
                .wait_connected(&channel, Some(Duration::from_millis(100)))
                .unwrap();
            let child = self
                .b
                .accept(&listener, Some(Duration::from_millis(100)))
                .unwrap();
            (listener, channel, child)
        }
    }

    #[test]
    fn test_pair_fragmented_transfer() {
        let pair = Pair::new();
        let (_listener, channel, child) = pair.open();
        assert_eq!(pair.a.get_options(&channel).out_mtu, 1024);
        assert_eq!(pair.b.get_options(&child).out_mtu, L2CAP_DEFAULT_MTU);

        let mut payload = vec![0u8; 1000];
        rand::thread_rng().fill(&mut payload[..]);
        pair.a.send(&channel, &payload).unwrap();
        assert_eq!(pair.ta.sent.lock().unwrap().len(), 2);
        pair.pump();

        assert_eq!(
            pair.b.receive(&child, Some(Duration::from_millis(100))),
            Ok(payload)
        );

        pair.b.send(&child, b"ack").unwrap();
        pair.pump();
        assert_eq!(pair.a.try_receive(&channel), Ok(Some(b"ack".to_vec())));
    }

    #[test]
    fn test_pair_close_and_idle_teardown() {
        let pair = Pair::new();
        let events = pair.a.subscribe();
        let (_listener, channel, child) = pair.open();

        pair.a.close(&channel).unwrap();
        pair.a.close(&channel).unwrap();
        pair.pump();

        assert_eq!(channel.state(), L2capChannelState::Closed);
        assert_eq!(child.state(), L2capChannelState::Closed);
        assert_eq!(
            pair.b.try_receive(&child),
            Err(L2capError::ConnectionReset)
        );

        let disconnected = events
            .try_iter()
            .filter(|event| matches!(event, ChannelEvent::Disconnected { .. }))
            .count();
        assert_eq!(disconnected, 1);

        // both links are idle; the initiator tears its side down
        pair.a
            .process_timers(Instant::now() + Duration::from_secs(30));
        pair.pump();
        assert_eq!(pair.a.connection_count(), 0);
        assert_eq!(pair.b.connection_count(), 0);
    }

    #[test]
    fn test_pair_shutdown() {
        let pair = Pair::new();
        let (_listener, channel, _child) = pair.open();

        pair.a.shutdown();
        assert_eq!(channel.take_error(), Some(L2capError::NoDevice));
        assert_eq!(pair.a.connection_count(), 0);
    }
}
