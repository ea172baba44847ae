//! L2CAP Signaling channel implementation
//!
//! This module encodes and decodes the signaling commands carried on the
//! fixed signaling channel (CID 0x0001): connection management,
//! configuration, echo and information requests.

use super::constants::*;
use super::packet::*;
use super::psm::Psm;
use super::types::*;
use crate::error::{L2capError, L2capResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// L2CAP Signaling message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    /// Command Reject
    CommandReject {
        identifier: SignalId,
        reason: u16,
        data: Vec<u8>,
    },

    /// Connection Request
    ConnectionRequest {
        identifier: SignalId,
        psm: Psm,
        source_cid: ChannelId,
    },

    /// Connection Response
    ConnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
        result: u16,
        status: u16,
    },

    /// Configuration Request
    ConfigureRequest {
        identifier: SignalId,
        destination_cid: ChannelId,
        flags: u16,
        options: ConfigOptions,
    },

    /// Configuration Response
    ConfigureResponse {
        identifier: SignalId,
        source_cid: ChannelId,
        flags: u16,
        result: u16,
        options: ConfigOptions,
    },

    /// Disconnection Request
    DisconnectionRequest {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },

    /// Disconnection Response
    DisconnectionResponse {
        identifier: SignalId,
        destination_cid: ChannelId,
        source_cid: ChannelId,
    },

    /// Echo Request
    EchoRequest { identifier: SignalId, data: Vec<u8> },

    /// Echo Response
    EchoResponse { identifier: SignalId, data: Vec<u8> },

    /// Information Request
    InformationRequest { identifier: SignalId, info_type: u16 },

    /// Information Response
    InformationResponse {
        identifier: SignalId,
        info_type: u16,
        result: u16,
        data: Vec<u8>,
    },
}

fn read_u16(cursor: &mut Cursor<&[u8]>, what: &str) -> L2capResult<u16> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| L2capError::InvalidParameter(format!("Failed to read {}", what)))
}

/// Read a configuration option value as a little-endian integer of 1, 2 or
/// 4 bytes.
fn option_value(data: &[u8]) -> Option<u32> {
    let mut cursor = Cursor::new(data);
    match data.len() {
        1 => cursor.read_u8().ok().map(u32::from),
        2 => cursor.read_u16::<LittleEndian>().ok().map(u32::from),
        4 => cursor.read_u32::<LittleEndian>().ok(),
        _ => None,
    }
}

impl SignalingMessage {
    /// Get the command code for this signaling message
    pub fn command_code(&self) -> u8 {
        match self {
            Self::CommandReject { .. } => L2CAP_COMMAND_REJECT,
            Self::ConnectionRequest { .. } => L2CAP_CONNECTION_REQUEST,
            Self::ConnectionResponse { .. } => L2CAP_CONNECTION_RESPONSE,
            Self::ConfigureRequest { .. } => L2CAP_CONFIGURE_REQUEST,
            Self::ConfigureResponse { .. } => L2CAP_CONFIGURE_RESPONSE,
            Self::DisconnectionRequest { .. } => L2CAP_DISCONNECTION_REQUEST,
            Self::DisconnectionResponse { .. } => L2CAP_DISCONNECTION_RESPONSE,
            Self::EchoRequest { .. } => L2CAP_ECHO_REQUEST,
            Self::EchoResponse { .. } => L2CAP_ECHO_RESPONSE,
            Self::InformationRequest { .. } => L2CAP_INFORMATION_REQUEST,
            Self::InformationResponse { .. } => L2CAP_INFORMATION_RESPONSE,
        }
    }

    /// Get the identifier for this signaling message
    pub fn identifier(&self) -> SignalId {
        match self {
            Self::CommandReject { identifier, .. }
            | Self::ConnectionRequest { identifier, .. }
            | Self::ConnectionResponse { identifier, .. }
            | Self::ConfigureRequest { identifier, .. }
            | Self::ConfigureResponse { identifier, .. }
            | Self::DisconnectionRequest { identifier, .. }
            | Self::DisconnectionResponse { identifier, .. }
            | Self::EchoRequest { identifier, .. }
            | Self::EchoResponse { identifier, .. }
            | Self::InformationRequest { identifier, .. }
            | Self::InformationResponse { identifier, .. } => *identifier,
        }
    }

    /// Parse configuration options from raw bytes.
    ///
    /// Only MTU and Flush Timeout are understood. Other option types are
    /// recorded in `unknown` whether or not their hint bit is set. An option
    /// running past the end of the buffer stops parsing.
    pub fn parse_config_options(data: &[u8]) -> ConfigOptions {
        let mut options = ConfigOptions::default();
        let mut offset = 0;

        while offset + L2CAP_CONF_OPT_HEADER_SIZE <= data.len() {
            let raw_type = data[offset];
            let option_type = raw_type & L2CAP_CONF_TYPE_MASK;
            let option_length = data[offset + 1] as usize;
            let start = offset + L2CAP_CONF_OPT_HEADER_SIZE;

            if start + option_length > data.len() {
                log::warn!(
                    "Configuration option 0x{:02X} overruns buffer ({} > {})",
                    raw_type,
                    start + option_length,
                    data.len()
                );
                break;
            }

            let value = option_value(&data[start..start + option_length]);

            match (option_type, value) {
                (L2CAP_CONF_MTU, Some(mtu)) if option_length == 2 => {
                    options.mtu = Some(mtu as u16);
                }
                (L2CAP_CONF_FLUSH_TIMEOUT, Some(timeout)) if option_length == 2 => {
                    options.flush_timeout = Some(timeout as u16);
                }
                _ => {
                    if raw_type & L2CAP_CONF_HINT == 0 {
                        log::debug!("Ignoring unknown configuration option 0x{:02X}", raw_type);
                    }
                    options.unknown.push(raw_type);
                }
            }

            offset = start + option_length;
        }

        options
    }

    /// Serialize configuration options to bytes
    pub fn serialize_config_options(options: &ConfigOptions) -> Vec<u8> {
        let mut result = Vec::new();

        if let Some(mtu) = options.mtu {
            result.push(L2CAP_CONF_MTU);
            result.push(2);
            result.extend_from_slice(&mtu.to_le_bytes());
        }

        if let Some(timeout) = options.flush_timeout {
            result.push(L2CAP_CONF_FLUSH_TIMEOUT);
            result.push(2);
            result.extend_from_slice(&timeout.to_le_bytes());
        }

        result
    }

    /// Parse a single signaling message (command header followed by its
    /// parameters) from raw bytes
    pub fn parse(data: &[u8]) -> L2capResult<Self> {
        let header = L2capCommandHeader::parse(data)
            .ok_or_else(|| L2capError::InvalidParameter("Signaling data too short".into()))?;
        let end = L2CAP_COMMAND_HEADER_SIZE + header.length as usize;

        if data.len() < end {
            return Err(L2capError::InvalidParameter(
                "Command parameters too short".into(),
            ));
        }

        Self::parse_command(&header, &data[L2CAP_COMMAND_HEADER_SIZE..end])
    }

    /// Decode the parameters of a command whose header was already read.
    ///
    /// Unknown command codes yield `ProtocolError`; the dispatcher answers
    /// those with a Command Reject.
    pub fn parse_command(header: &L2capCommandHeader, params: &[u8]) -> L2capResult<Self> {
        let identifier = header.identifier;
        let mut cursor = Cursor::new(params);

        let too_short = |name: &str| {
            L2capError::InvalidParameter(format!("{} parameters too short", name))
        };

        match header.code {
            L2CAP_COMMAND_REJECT => {
                if params.len() < 2 {
                    return Err(too_short("Command reject"));
                }
                let reason = read_u16(&mut cursor, "reason")?;

                Ok(Self::CommandReject {
                    identifier,
                    reason,
                    data: params[2..].to_vec(),
                })
            }

            L2CAP_CONNECTION_REQUEST => {
                if params.len() < 4 {
                    return Err(too_short("Connection request"));
                }
                let psm = Psm(read_u16(&mut cursor, "PSM")?);
                let source_cid = read_u16(&mut cursor, "source CID")?;

                Ok(Self::ConnectionRequest {
                    identifier,
                    psm,
                    source_cid,
                })
            }

            L2CAP_CONNECTION_RESPONSE => {
                if params.len() < 8 {
                    return Err(too_short("Connection response"));
                }

                Ok(Self::ConnectionResponse {
                    identifier,
                    destination_cid: read_u16(&mut cursor, "destination CID")?,
                    source_cid: read_u16(&mut cursor, "source CID")?,
                    result: read_u16(&mut cursor, "result")?,
                    status: read_u16(&mut cursor, "status")?,
                })
            }

            L2CAP_CONFIGURE_REQUEST => {
                if params.len() < 4 {
                    return Err(too_short("Configure request"));
                }
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let flags = read_u16(&mut cursor, "flags")?;

                Ok(Self::ConfigureRequest {
                    identifier,
                    destination_cid,
                    flags,
                    options: Self::parse_config_options(&params[4..]),
                })
            }

            L2CAP_CONFIGURE_RESPONSE => {
                if params.len() < 6 {
                    return Err(too_short("Configure response"));
                }
                let source_cid = read_u16(&mut cursor, "source CID")?;
                let flags = read_u16(&mut cursor, "flags")?;
                let result = read_u16(&mut cursor, "result")?;

                Ok(Self::ConfigureResponse {
                    identifier,
                    source_cid,
                    flags,
                    result,
                    options: Self::parse_config_options(&params[6..]),
                })
            }

            L2CAP_DISCONNECTION_REQUEST | L2CAP_DISCONNECTION_RESPONSE => {
                if params.len() < 4 {
                    return Err(too_short("Disconnection"));
                }
                let destination_cid = read_u16(&mut cursor, "destination CID")?;
                let source_cid = read_u16(&mut cursor, "source CID")?;

                if header.code == L2CAP_DISCONNECTION_REQUEST {
                    Ok(Self::DisconnectionRequest {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                } else {
                    Ok(Self::DisconnectionResponse {
                        identifier,
                        destination_cid,
                        source_cid,
                    })
                }
            }

            L2CAP_ECHO_REQUEST => Ok(Self::EchoRequest {
                identifier,
                data: params.to_vec(),
            }),

            L2CAP_ECHO_RESPONSE => Ok(Self::EchoResponse {
                identifier,
                data: params.to_vec(),
            }),

            L2CAP_INFORMATION_REQUEST => {
                if params.len() < 2 {
                    return Err(too_short("Information request"));
                }

                Ok(Self::InformationRequest {
                    identifier,
                    info_type: read_u16(&mut cursor, "info type")?,
                })
            }

            L2CAP_INFORMATION_RESPONSE => {
                if params.len() < 4 {
                    return Err(too_short("Information response"));
                }
                let info_type = read_u16(&mut cursor, "info type")?;
                let result = read_u16(&mut cursor, "result")?;

                Ok(Self::InformationResponse {
                    identifier,
                    info_type,
                    result,
                    data: params[4..].to_vec(),
                })
            }

            code => Err(L2capError::ProtocolError(format!(
                "Unknown signaling command 0x{:02X}",
                code
            ))),
        }
    }

    /// Serialize the signaling message (command header plus parameters)
    pub fn serialize(&self) -> Vec<u8> {
        let mut params = match self {
            Self::CommandReject { reason, data, .. } => {
                let mut params = Vec::with_capacity(2 + data.len());
                params.extend_from_slice(&reason.to_le_bytes());
                params.extend_from_slice(data);
                params
            }

            Self::ConnectionRequest {
                psm, source_cid, ..
            } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&psm.value().to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::ConnectionResponse {
                destination_cid,
                source_cid,
                result,
                status,
                ..
            } => {
                let mut params = Vec::with_capacity(8);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&status.to_le_bytes());
                params
            }

            Self::ConfigureRequest {
                destination_cid,
                flags,
                options,
                ..
            } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(4 + option_bytes.len());
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::ConfigureResponse {
                source_cid,
                flags,
                result,
                options,
                ..
            } => {
                let option_bytes = Self::serialize_config_options(options);
                let mut params = Vec::with_capacity(6 + option_bytes.len());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params.extend_from_slice(&flags.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(&option_bytes);
                params
            }

            Self::DisconnectionRequest {
                destination_cid,
                source_cid,
                ..
            }
            | Self::DisconnectionResponse {
                destination_cid,
                source_cid,
                ..
            } => {
                let mut params = Vec::with_capacity(4);
                params.extend_from_slice(&destination_cid.to_le_bytes());
                params.extend_from_slice(&source_cid.to_le_bytes());
                params
            }

            Self::EchoRequest { data, .. } | Self::EchoResponse { data, .. } => data.clone(),

            Self::InformationRequest { info_type, .. } => info_type.to_le_bytes().to_vec(),

            Self::InformationResponse {
                info_type,
                result,
                data,
                ..
            } => {
                let mut params = Vec::with_capacity(4 + data.len());
                params.extend_from_slice(&info_type.to_le_bytes());
                params.extend_from_slice(&result.to_le_bytes());
                params.extend_from_slice(data);
                params
            }
        };

        let cmd_header =
            L2capCommandHeader::new(self.command_code(), self.identifier(), params.len() as u16);

        let mut result = Vec::with_capacity(L2CAP_COMMAND_HEADER_SIZE + params.len());
        result.extend_from_slice(&cmd_header.to_bytes());
        result.append(&mut params);

        result
    }

    /// Wrap this message in a frame addressed to the signaling channel
    pub fn to_packet(&self) -> L2capPacket {
        L2capPacket::new(L2CAP_SIGNALING_CID, self.serialize())
    }
}
