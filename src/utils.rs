//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the harness: identifiers for client instances,
//! wall-clock timestamps carried inside messages, validation of configuration
//! values and human-readable formatting for log output.
//!
//! ## Usage Examples
//!
//! ```rust
//! use mb_harness::utils::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
//! assert_eq!(format_message_rate(1500.0), "1.50K msg/s");
//! validate_message_size(1024)?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique identifier for a client instance
///
/// Client ids show up in every progress line a replica logs, which makes it
/// possible to tell several harness processes apart when their logs are
/// collected together.
pub fn generate_client_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp as nanoseconds since Unix epoch
///
/// Publishers stamp every message with this value and consumers subtract it
/// from their own clock, so latency is only meaningful when both sides share
/// a clock (same host, or NTP-synchronised hosts).
///
/// If the system time is before the Unix epoch, returns 0 rather than
/// panicking.
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Time elapsed since a timestamp produced by [`current_timestamp_ns`]
///
/// Clock skew between publisher and consumer can put the send timestamp in
/// the future; that case saturates to zero.
pub fn elapsed_since_ns(timestamp_ns: u64) -> Duration {
    Duration::from_nanos(current_timestamp_ns().saturating_sub(timestamp_ns))
}

/// Format a duration in a human-readable way
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: compound format (e.g., "2m 30s")
///
/// ```rust
/// # use mb_harness::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_secs(150)), "2m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format a message rate in a human-readable way
///
/// Uses decimal scaling (powers of 1000):
/// - Messages/sec: < 1,000 (e.g., "750 msg/s")
/// - Thousands: < 1,000,000 (e.g., "15.50K msg/s")
/// - Millions: ≥ 1,000,000 (e.g., "2.30M msg/s")
pub fn format_message_rate(messages_per_second: f64) -> String {
    if messages_per_second < 1000.0 {
        format!("{:.0} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

/// Validate buffer size parameter
///
/// Socket buffers below 1KB make the kernel clamp anyway and above 100MB are
/// almost certainly a typo in the configuration file.
pub fn validate_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size < 1024 {
        return Err(anyhow!("Buffer size must be at least 1024 bytes"));
    }

    if buffer_size > 100 * 1024 * 1024 {
        return Err(anyhow!("Buffer size must be less than 100MB"));
    }

    Ok(())
}

/// Validate message size parameter
///
/// The upper bound matches the 16MB frame limit of the socket transports,
/// minus headroom for the message envelope.
pub fn validate_message_size(message_size: usize) -> Result<()> {
    if message_size > crate::ipc::MAX_FRAME_SIZE - 1024 {
        return Err(anyhow!(
            "Message size must be less than {} bytes",
            crate::ipc::MAX_FRAME_SIZE - 1024
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_nanos(1500)), "1.50μs");
        assert_eq!(format_duration(Duration::from_nanos(1_500_000)), "1.50ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_duration(Duration::from_secs(150)), "2m 30s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_message_rate() {
        assert_eq!(format_message_rate(500.0), "500 msg/s");
        assert_eq!(format_message_rate(1500.0), "1.50K msg/s");
        assert_eq!(format_message_rate(1500000.0), "1.50M msg/s");
    }

    #[test]
    fn test_elapsed_since_future_timestamp_saturates() {
        let future = current_timestamp_ns() + 60_000_000_000;
        assert_eq!(elapsed_since_ns(future), Duration::ZERO);
    }

    #[test]
    fn test_validate_buffer_size() {
        assert!(validate_buffer_size(8192).is_ok());
        assert!(validate_buffer_size(512).is_err());
        assert!(validate_buffer_size(200 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_validate_message_size() {
        assert!(validate_message_size(0).is_ok());
        assert!(validate_message_size(1024).is_ok());
        assert!(validate_message_size(16 * 1024 * 1024).is_err());
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(generate_client_id(), generate_client_id());
    }
}
