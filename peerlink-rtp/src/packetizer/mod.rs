//! Frame-to-RTP payload splitting.

pub mod h264;
pub mod sprop;

/// Limits on RTP payload sizes for a packetized frame.
///
/// Reductions express per-position overhead reserved by the caller (e.g.
/// space for an aggregate header in the first packet or a shorter last
/// packet to leave room for FEC).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSizeLimits {
    pub max_payload_len: usize,
    pub first_packet_reduction_len: usize,
    pub last_packet_reduction_len: usize,
    pub single_packet_reduction_len: usize,
}

impl Default for PayloadSizeLimits {
    fn default() -> Self {
        PayloadSizeLimits {
            max_payload_len: 1200,
            first_packet_reduction_len: 0,
            last_packet_reduction_len: 0,
            single_packet_reduction_len: 0,
        }
    }
}

/// Splits `payload_len` bytes into roughly equal chunks honoring `limits`.
///
/// The split count is `ceil((payload + overhead) / max)`; sizes differ by
/// at most one byte, with the larger chunks at the tail. Returns an empty
/// vector when the limits leave no room.
pub fn split_about_equally(payload_len: usize, limits: &PayloadSizeLimits) -> Vec<usize> {
    if payload_len == 0 || limits.max_payload_len == 0 {
        return Vec::new();
    }
    if payload_len + limits.single_packet_reduction_len <= limits.max_payload_len {
        return vec![payload_len];
    }
    if limits.max_payload_len <= limits.first_packet_reduction_len
        || limits.max_payload_len <= limits.last_packet_reduction_len
    {
        return Vec::new();
    }

    let total_bytes =
        payload_len + limits.first_packet_reduction_len + limits.last_packet_reduction_len;
    let mut num_packets_left = (total_bytes + limits.max_payload_len - 1) / limits.max_payload_len;
    if num_packets_left == 1 {
        // The single-packet reduction did not fit: force a split.
        num_packets_left = 2;
    }
    let mut bytes_per_packet = total_bytes / num_packets_left;
    let num_larger_packets = total_bytes % num_packets_left;

    let mut result = Vec::with_capacity(num_packets_left);
    let mut remaining = payload_len;
    let mut first_packet = true;
    while remaining > 0 {
        // The last `num_larger_packets` chunks grow by one byte.
        if num_packets_left == num_larger_packets {
            bytes_per_packet += 1;
        }
        let mut current = bytes_per_packet;
        if first_packet {
            current = current
                .saturating_sub(limits.first_packet_reduction_len)
                .max(1);
        }
        if num_packets_left == 1 {
            current = current.saturating_sub(limits.last_packet_reduction_len);
        }
        current = current.clamp(1, remaining);
        result.push(current);
        remaining -= current;
        num_packets_left = num_packets_left.saturating_sub(1);
        first_packet = false;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max: usize) -> PayloadSizeLimits {
        PayloadSizeLimits {
            max_payload_len: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_packet_when_it_fits() {
        assert_eq!(split_about_equally(800, &limits(1200)), vec![800]);
        assert_eq!(split_about_equally(1200, &limits(1200)), vec![1200]);
    }

    #[test]
    fn test_single_packet_reduction_forces_split() {
        let l = PayloadSizeLimits {
            max_payload_len: 1200,
            single_packet_reduction_len: 100,
            ..Default::default()
        };
        let sizes = split_about_equally(1150, &l);
        assert_eq!(sizes.len(), 2);
        assert_eq!(sizes.iter().sum::<usize>(), 1150);
    }

    #[test]
    fn test_split_count_and_balance() {
        let sizes = split_about_equally(2500, &limits(1200));
        assert_eq!(sizes.len(), 3);
        assert_eq!(sizes.iter().sum::<usize>(), 2500);
        let min = *sizes.iter().min().unwrap();
        let max = *sizes.iter().max().unwrap();
        assert!(max - min <= 1);
        assert!(max <= 1200);
    }

    #[test]
    fn test_first_and_last_reductions_respected() {
        let l = PayloadSizeLimits {
            max_payload_len: 1000,
            first_packet_reduction_len: 100,
            last_packet_reduction_len: 200,
            single_packet_reduction_len: 0,
        };
        let sizes = split_about_equally(2700, &l);
        assert_eq!(sizes.iter().sum::<usize>(), 2700);
        assert!(sizes[0] + l.first_packet_reduction_len <= l.max_payload_len);
        assert!(sizes[sizes.len() - 1] + l.last_packet_reduction_len <= l.max_payload_len);
        for size in &sizes {
            assert!(*size <= l.max_payload_len);
        }
    }

    #[test]
    fn test_degenerate_limits() {
        assert!(split_about_equally(10, &limits(0)).is_empty());
        let l = PayloadSizeLimits {
            max_payload_len: 10,
            first_packet_reduction_len: 10,
            ..Default::default()
        };
        assert!(split_about_equally(100, &l).is_empty());
    }
}
