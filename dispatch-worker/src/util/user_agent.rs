//! User agent classification for open and click events.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    /// Image proxies fetch pixels on the recipient's behalf.
    Proxy,
    #[default]
    Unknown,
}

/// Device and mail client inferred from a tracking request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub device: DeviceClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

/// Known mail clients and image proxies, checked in order.
const CLIENT_MARKERS: &[(&str, &str)] = &[
    ("googleimageproxy", "gmail"),
    ("yahoomailproxy", "yahoo"),
    ("microsoft outlook", "outlook"),
    ("ms-office", "outlook"),
    ("thunderbird", "thunderbird"),
    ("applewebkit", "webkit"),
    ("firefox", "firefox"),
    ("chrome", "chrome"),
];

/// Classify a raw `User-Agent` header.
pub fn classify(user_agent: Option<&str>) -> ClientInfo {
    let ua = match user_agent {
        Some(ua) if !ua.trim().is_empty() => ua.to_lowercase(),
        _ => return ClientInfo::default(),
    };

    let client = CLIENT_MARKERS
        .iter()
        .find(|(marker, _)| ua.contains(marker))
        .map(|(_, name)| name.to_string());

    let device = if ua.contains("googleimageproxy") || ua.contains("yahoomailproxy") {
        DeviceClass::Proxy
    } else if ua.contains("ipad") || ua.contains("tablet") {
        DeviceClass::Tablet
    } else if ua.contains("iphone") || ua.contains("android") || ua.contains("mobile") {
        DeviceClass::Mobile
    } else if ua.contains("windows") || ua.contains("macintosh") || ua.contains("x11") {
        DeviceClass::Desktop
    } else {
        DeviceClass::Unknown
    };

    ClientInfo { device, client }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_missing_agent() {
        assert_eq!(classify(None), ClientInfo::default());
        assert_eq!(classify(Some("  ")), ClientInfo::default());
    }

    #[test]
    fn test_classify_gmail_proxy() {
        let info = classify(Some(
            "Mozilla/5.0 (Windows NT 5.1; rv:11.0) Gecko Firefox/11.0 (via ggpht.com GoogleImageProxy)",
        ));
        assert_eq!(info.device, DeviceClass::Proxy);
        assert_eq!(info.client.as_deref(), Some("gmail"));
    }

    #[test]
    fn test_classify_iphone() {
        let info = classify(Some(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
        ));
        assert_eq!(info.device, DeviceClass::Mobile);
        assert_eq!(info.client.as_deref(), Some("webkit"));
    }

    #[test]
    fn test_classify_desktop_outlook() {
        let info = classify(Some("Microsoft Outlook 16.0.17126; Windows NT 10.0"));
        assert_eq!(info.device, DeviceClass::Desktop);
        assert_eq!(info.client.as_deref(), Some("outlook"));
    }
}
