use uuid::Uuid;

/**
 * The UUID of the Nordic UART Service.
 */
pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);

/**
 * The UUID of the NUS characteristic that the central writes to (the peripheral's RX).
 */
pub const NUS_WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);

/**
 * Default spacing (milliseconds) between writes of a repeating send.
 */
pub const DEFAULT_LOOP_PERIOD: u64 = 500;

/**
 * Default duration (seconds) of a scan started from the command line.
 */
pub const DEFAULT_SCAN_SECONDS: u64 = 5;

/**
 * Default capacity of the radio event and session event channels.
 */
pub const DEFAULT_EVENT_QUEUE: usize = 64;

/**
 * How long (milliseconds) opening a link may take before it is reported as a timeout.
 */
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10_000;

/**
 * How many unacknowledged writes may be queued on a link before writes are rejected as busy.
 */
pub const LINK_WRITE_QUEUE: usize = 32;

// Link status codes, as reported by the host's GATT layer.
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_TIMEOUT: i32 = 8;
pub const STATUS_PEER_DISCONNECTED: i32 = 19;
pub const STATUS_GATT_ERROR: i32 = 133;
