/// Priority classes understood by the pacer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPriority {
    High,
    Normal,
    Low,
}

/// External scheduler that spreads packet transmission over time, bounded by
/// the bandwidth estimate.
///
/// The pacer never touches packet bytes; it holds descriptors and calls back
/// into the sender (`RtpSender::time_to_send_packet`,
/// `RtpSender::time_to_send_padding`) when a packet's turn arrives.
pub trait Pacer: Send + Sync {
    /// Offers a packet descriptor to the pacer.
    ///
    /// `true` means the sender should transmit immediately; `false` means
    /// the pacer queued the descriptor and will call back when it is time.
    fn enqueue(
        &self,
        priority: PacketPriority,
        ssrc: u32,
        sequence_number: u16,
        capture_time_ms: i64,
        payload_length: usize,
        is_retransmission: bool,
    ) -> bool;
}
