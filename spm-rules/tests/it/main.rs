mod concurrency;
mod ordering;
mod table;

use bytes::{BufMut, BytesMut};
use spm_wire::{
    packet::{ETH_P_IP, IPPROTO_TCP},
    MacAddr, Packet, PacketFields,
};

pub const HOST: MacAddr = MacAddr([0x02, 0x00, 0x5e, 0x10, 0x00, 0x01]);
pub const GATEWAY: MacAddr = MacAddr([0x02, 0x00, 0x5e, 0x10, 0x00, 0xfe]);

/// Builds an Ethernet + IPv4 + TCP frame sent by `src` to `GATEWAY`.
pub fn tcp_frame(src: MacAddr, dsfield: u8, dst_port: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(54);
    buf.put_slice(&GATEWAY.0);
    buf.put_slice(&src.0);
    buf.put_u16(ETH_P_IP);

    buf.put_u8(0x45);
    buf.put_u8(dsfield);
    buf.put_u16(40);
    buf.put_u32(0);
    buf.put_u8(64);
    buf.put_u8(IPPROTO_TCP);
    buf.put_u16(0);
    buf.put_slice(&[192, 168, 1, 20]);
    buf.put_slice(&[93, 184, 216, 34]);

    buf.put_u16(51000);
    buf.put_u16(dst_port);
    buf.put_u32(1);
    buf.put_u32(0);
    buf.put_u16(0x5002);
    buf.put_u16(64240);
    buf.put_u32(0);
    buf
}

pub fn tcp_packet(dsfield: u8, dst_port: u16, priority: u32) -> Packet {
    let fields = PacketFields::parse(&tcp_frame(HOST, dsfield, dst_port)).unwrap();
    Packet::new(fields, priority)
}

pub fn l2_packet(src: MacAddr) -> Packet {
    Packet::new(PacketFields::ethernet(src, GATEWAY, 0x88B5), 0)
}
