//! L2CAP protocol constants
//!
//! Values from the Bluetooth Core Specification Vol 3, Part A.

// Header sizes
pub const L2CAP_BASIC_HEADER_SIZE: usize = 4;
pub const L2CAP_COMMAND_HEADER_SIZE: usize = 4;

// Fixed channel identifiers
pub const L2CAP_NULL_CID: u16 = 0x0000;
pub const L2CAP_SIGNALING_CID: u16 = 0x0001;
pub const L2CAP_CONNECTIONLESS_CID: u16 = 0x0002;

// Dynamic channel identifier range (ACL-U)
pub const L2CAP_DYNAMIC_CID_MIN: u16 = 0x0040;
pub const L2CAP_DYNAMIC_CID_MAX: u16 = 0xFFFF;

// Default MTU and flush timeout
pub const L2CAP_DEFAULT_MTU: u16 = 672;
pub const L2CAP_MIN_MTU: u16 = 48;
pub const L2CAP_DEFAULT_FLUSH_TIMEOUT: u16 = 0xFFFF;

// Signaling identifiers issued by this engine. 200..=254 are left to
// external diagnostic tools.
pub const L2CAP_IDENT_MIN: u8 = 1;
pub const L2CAP_IDENT_MAX: u8 = 199;

// Signaling command codes
pub const L2CAP_COMMAND_REJECT: u8 = 0x01;
pub const L2CAP_CONNECTION_REQUEST: u8 = 0x02;
pub const L2CAP_CONNECTION_RESPONSE: u8 = 0x03;
pub const L2CAP_CONFIGURE_REQUEST: u8 = 0x04;
pub const L2CAP_CONFIGURE_RESPONSE: u8 = 0x05;
pub const L2CAP_DISCONNECTION_REQUEST: u8 = 0x06;
pub const L2CAP_DISCONNECTION_RESPONSE: u8 = 0x07;
pub const L2CAP_ECHO_REQUEST: u8 = 0x08;
pub const L2CAP_ECHO_RESPONSE: u8 = 0x09;
pub const L2CAP_INFORMATION_REQUEST: u8 = 0x0A;
pub const L2CAP_INFORMATION_RESPONSE: u8 = 0x0B;

// Command reject reasons
pub const L2CAP_REJECT_NOT_UNDERSTOOD: u16 = 0x0000;
pub const L2CAP_REJECT_INVALID_CID: u16 = 0x0002;

// Connection response results
pub const L2CAP_CR_SUCCESS: u16 = 0x0000;
pub const L2CAP_CR_PENDING: u16 = 0x0001;
pub const L2CAP_CR_BAD_PSM: u16 = 0x0002;
pub const L2CAP_CR_NO_MEM: u16 = 0x0004;

// Connection response status (meaningful with L2CAP_CR_PENDING)
pub const L2CAP_CS_NO_INFO: u16 = 0x0000;

// Configure response results
pub const L2CAP_CONF_SUCCESS: u16 = 0x0000;
pub const L2CAP_CONF_UNACCEPT: u16 = 0x0001;
pub const L2CAP_CONF_REJECT: u16 = 0x0002;

// Configure flags
pub const L2CAP_CONF_FLAG_CONTINUATION: u16 = 0x0001;

// Configuration option types
pub const L2CAP_CONF_MTU: u8 = 0x01;
pub const L2CAP_CONF_FLUSH_TIMEOUT: u8 = 0x02;
pub const L2CAP_CONF_HINT: u8 = 0x80;
pub const L2CAP_CONF_TYPE_MASK: u8 = 0x7F;
pub const L2CAP_CONF_OPT_HEADER_SIZE: usize = 2;

// Information request types and results
pub const L2CAP_IT_FEAT_MASK: u16 = 0x0002;
pub const L2CAP_IR_NOT_SUPPORTED: u16 = 0x0001;

// Priorities handed to the baseband layer
pub const L2CAP_SIGNALING_PRIORITY: u8 = 7;
pub const L2CAP_DEFAULT_PRIORITY: u8 = 0;
