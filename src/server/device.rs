// src/server/device.rs

//! Derives a coarse device class from the User-Agent. Every class keys its
//! own cache variant, so the classifier must be stable above all else.

/// Device classes, in cache-variant order.
pub const DEVICE_UNKNOWN: usize = 0;
pub const DEVICE_COMPUTER: usize = 1;
pub const DEVICE_TABLET: usize = 2;
pub const DEVICE_PHONE: usize = 3;
pub const DEVICE_CONSOLE: usize = 4;

/// Number of device classes; invalidation touches every one of them.
pub const DEVICE_CLASSES: usize = 5;

/// Classifies a User-Agent string.
pub fn device_class(ua: &str) -> usize {
    if ua.is_empty() {
        return DEVICE_UNKNOWN;
    }
    let ua = ua.to_ascii_lowercase();

    if ["playstation", "xbox", "nintendo", "ouya"]
        .iter()
        .any(|v| ua.contains(v))
    {
        return DEVICE_CONSOLE;
    }

    // Tablets advertise themselves as mobile too; test them first.
    if ["ipad", "tablet", "kindle", "silk/"]
        .iter()
        .any(|v| ua.contains(v))
    {
        return DEVICE_TABLET;
    }

    if ["mobile", "iphone", "ipod", "android", "phone", "opera mini", "blackberry"]
        .iter()
        .any(|v| ua.contains(v))
    {
        return DEVICE_PHONE;
    }

    if ["windows", "macintosh", "x11", "linux", "cros"]
        .iter()
        .any(|v| ua.contains(v))
    {
        return DEVICE_COMPUTER;
    }

    DEVICE_UNKNOWN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_agents() {
        assert_eq!(
            device_class("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36"),
            DEVICE_COMPUTER
        );
        assert_eq!(
            device_class("Mozilla/5.0 (iPhone; CPU iPhone OS 12_0 like Mac OS X) Mobile/15E148"),
            DEVICE_PHONE
        );
        assert_eq!(
            device_class("Mozilla/5.0 (iPad; CPU OS 12_0 like Mac OS X)"),
            DEVICE_TABLET
        );
        assert_eq!(
            device_class("Mozilla/5.0 (PlayStation 4 5.55) AppleWebKit/601.2"),
            DEVICE_CONSOLE
        );
        assert_eq!(device_class(""), DEVICE_UNKNOWN);
    }

    #[test]
    fn android_tablet_stays_tablet() {
        assert_eq!(
            device_class("Mozilla/5.0 (Linux; Android 9; SM-T820 Tablet) Chrome/71.0"),
            DEVICE_TABLET
        );
    }
}
