use std::io::Error;
use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .filter_map(|ifa| {
            let ip = ifa.ip();
            // ip() returns std::net::IpAddr
            let family = if ip.is_ipv4() {"ipv4"} else {"ipv6"};
            let is_loopback = ip.is_loopback();

            Some(InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
            })
        }).collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Whether any non-loopback IPv4 address is currently assigned. Discovery
/// uses this to decide whether the local network status is connected.
pub fn has_routable_ipv4() -> bool {
    list_interface_ips_result()
        .map(|ifs| ifs.iter().any(|i| i.family == "ipv4" && !i.is_loopback))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_interface_ips_does_not_error() {
        // Environment-dependent, but must never fail outright.
        let _ = list_interface_ips_result();
    }
}