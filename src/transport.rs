/// Opaque sink for fully serialized, UDP-sized packets.
pub trait Transport: Send + Sync {
    /// Hands a packet to the network. Returns the number of bytes sent; a
    /// non-positive value is a failure and is not retried at this layer.
    fn send_packet(&self, channel_id: i32, packet: &[u8]) -> isize;
}
