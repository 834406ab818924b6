//! bird.conf rendering
//!
//! VIPs live in one static protocol per address family as blackhole routes.
//! Every peer gets a `bgp` protocol whose channel exports only the static
//! protocol of the peer's family and imports nothing.

use super::daemon::{BgpPeer, DesiredRouting};
use std::fmt::Write;

const VIP4_PROTOCOL: &str = "VIP4";
const VIP6_PROTOCOL: &str = "VIP6";

/// BIRD symbol for a peer
///
/// ASCII alphanumerics are kept and every other byte becomes `_` plus two
/// hex digits, so distinct peer names never share a symbol.
pub fn protocol_name(peer: &str) -> String {
    let mut symbol = String::with_capacity(4 + peer.len());
    symbol.push_str("NBR_");
    for byte in peer.bytes() {
        if byte.is_ascii_alphanumeric() {
            symbol.push(byte as char);
        } else {
            let _ = write!(symbol, "_{:02x}", byte);
        }
    }
    symbol
}

fn render_peer(out: &mut String, peer: &BgpPeer) {
    let (channel, export) = if peer.address.is_ipv4() {
        ("ipv4", VIP4_PROTOCOL)
    } else {
        ("ipv6", VIP6_PROTOCOL)
    };

    let _ = writeln!(out, "protocol bgp {} {{", protocol_name(&peer.name));
    let _ = writeln!(out, "    local port {} as {};", peer.local_port, peer.local_asn);
    let _ = writeln!(
        out,
        "    neighbor {} port {} as {};",
        peer.address, peer.remote_port, peer.remote_asn
    );
    if let Some(interface) = &peer.interface {
        let _ = writeln!(out, "    interface \"{}\";", interface);
    }
    let _ = writeln!(out, "    hold time {};", peer.hold_time);
    let _ = writeln!(out, "    {} {{", channel);
    let _ = writeln!(out, "        import none;");
    let _ = writeln!(out, "        export where proto = \"{}\";", export);
    let _ = writeln!(out, "    }};");
    let _ = writeln!(out, "}}");
}

/// Render the complete configuration for `state`
pub fn render(state: &DesiredRouting) -> String {
    let mut out = String::new();
    out.push_str("# Generated by sidelink, do not edit\n");
    out.push_str("log stderr all;\n\n");
    out.push_str("protocol device {\n}\n\n");

    for (name, channel, v4) in [(VIP4_PROTOCOL, "ipv4", true), (VIP6_PROTOCOL, "ipv6", false)] {
        let _ = writeln!(out, "protocol static {} {{", name);
        let _ = writeln!(out, "    {};", channel);
        for route in state.routes.iter().filter(|r| r.is_ipv4() == v4) {
            let _ = writeln!(out, "    route {} blackhole;", route);
        }
        out.push_str("}\n\n");
    }

    for peer in state.peers.values() {
        render_peer(&mut out, peer);
        out.push('\n');
    }
    out
}
