//! Timezone lookups for the IOT firmware.
//!
//! Legacy devices store their timezone as an index into a fixed table of
//! IANA names. The reverse map is built once per process.

use std::collections::HashMap;
use std::sync::OnceLock;

use tracing::error;

/// The firmware's index-to-IANA table.
pub const TIMEZONE_INDEX: [&str; 110] = [
    "Etc/GMT+12",
    "Pacific/Samoa",
    "US/Hawaii",
    "US/Alaska",
    "Mexico/BajaNorte",
    "Etc/GMT+8",
    "PST8PDT",
    "US/Arizona",
    "America/Mazatlan",
    "MST",
    "MST7MDT",
    "Mexico/General",
    "Etc/GMT+6",
    "CST6CDT",
    "America/Monterrey",
    "Canada/Saskatchewan",
    "America/Bogota",
    "Etc/GMT+5",
    "EST",
    "America/Indiana/Indianapolis",
    "America/Caracas",
    "America/Asuncion",
    "Etc/GMT+4",
    "Canada/Atlantic",
    "America/Cuiaba",
    "Brazil/West",
    "America/Santiago",
    "Canada/Newfoundland",
    "America/Sao_Paulo",
    "America/Argentina/Buenos_Aires",
    "America/Cayenne",
    "America/Miquelon",
    "America/Montevideo",
    "Chile/Continental",
    "Etc/GMT+2",
    "Atlantic/Azores",
    "Atlantic/Cape_Verde",
    "Africa/Casablanca",
    "UCT",
    "GB",
    "Africa/Monrovia",
    "Europe/Amsterdam",
    "Europe/Belgrade",
    "Europe/Brussels",
    "Europe/Sarajevo",
    "Africa/Lagos",
    "Africa/Windhoek",
    "Asia/Amman",
    "Europe/Athens",
    "Asia/Beirut",
    "Africa/Cairo",
    "Asia/Damascus",
    "EET",
    "Africa/Harare",
    "Europe/Helsinki",
    "Asia/Istanbul",
    "Asia/Jerusalem",
    "Europe/Kaliningrad",
    "Africa/Tripoli",
    "Asia/Baghdad",
    "Asia/Kuwait",
    "Europe/Minsk",
    "Europe/Moscow",
    "Africa/Nairobi",
    "Asia/Tehran",
    "Asia/Muscat",
    "Asia/Baku",
    "Europe/Samara",
    "Indian/Mauritius",
    "Asia/Tbilisi",
    "Asia/Yerevan",
    "Asia/Kabul",
    "Asia/Ashgabat",
    "Asia/Yekaterinburg",
    "Asia/Karachi",
    "Asia/Kolkata",
    "Asia/Colombo",
    "Asia/Kathmandu",
    "Asia/Almaty",
    "Asia/Dhaka",
    "Asia/Novosibirsk",
    "Asia/Rangoon",
    "Asia/Bangkok",
    "Asia/Krasnoyarsk",
    "Asia/Chongqing",
    "Asia/Irkutsk",
    "Asia/Singapore",
    "Australia/Perth",
    "Asia/Taipei",
    "Asia/Ulaanbaatar",
    "Asia/Tokyo",
    "Asia/Seoul",
    "Asia/Yakutsk",
    "Australia/Adelaide",
    "Australia/Darwin",
    "Australia/Brisbane",
    "Australia/Canberra",
    "Pacific/Guam",
    "Australia/Hobart",
    "Antarctica/DumontDUrville",
    "Asia/Magadan",
    "Asia/Srednekolymsk",
    "Etc/GMT-11",
    "Asia/Anadyr",
    "Pacific/Auckland",
    "Etc/GMT-12",
    "Pacific/Fiji",
    "Etc/GMT-13",
    "Pacific/Apia",
    "Etc/GMT-14",
];

/// IANA name for a firmware timezone index. Unknown indices default to
/// UTC.
pub fn timezone_name(index: usize) -> &'static str {
    match TIMEZONE_INDEX.get(index) {
        Some(name) => name,
        None => {
            error!(
                "unexpected index {} not configured as a timezone, defaulting to UTC",
                index
            );
            "Etc/UTC"
        }
    }
}

fn reverse_index() -> &'static HashMap<&'static str, usize> {
    static REVERSE: OnceLock<HashMap<&'static str, usize>> = OnceLock::new();
    REVERSE.get_or_init(|| {
        TIMEZONE_INDEX
            .iter()
            .enumerate()
            .map(|(index, name)| (*name, index))
            .collect()
    })
}

/// Firmware index for an IANA timezone name, if the firmware supports it.
pub fn timezone_index(name: &str) -> Option<usize> {
    reverse_index().get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        assert_eq!(timezone_name(39), "GB");
        assert_eq!(timezone_name(75), "Asia/Kolkata");
        assert_eq!(timezone_index("Asia/Kolkata"), Some(75));
        assert_eq!(timezone_index("Europe/Moscow"), Some(62));
        assert_eq!(timezone_index("Mars/Olympus_Mons"), None);
    }

    #[test]
    fn test_unknown_index_defaults_to_utc() {
        assert_eq!(timezone_name(110), "Etc/UTC");
        assert_eq!(timezone_name(usize::MAX), "Etc/UTC");
    }

    #[test]
    fn test_table_is_complete() {
        assert_eq!(TIMEZONE_INDEX.len(), 110);
        // No duplicate names; the reverse lookup would silently drop them.
        assert_eq!(reverse_index().len(), 110);
    }
}
