//! Process and terminal helpers.

use sysinfo::System;

use crate::error::{Error, Result};

/// Size units from largest to smallest, as (suffix, bytes).
pub const UNITS: &[(&str, u64)] = &[
    ("PB", 1 << 50),
    ("TB", 1 << 40),
    ("GB", 1 << 30),
    ("MB", 1 << 20),
    ("KB", 1 << 10),
    ("B", 1),
];

const DEFAULT_TERMINAL_WIDTH: usize = 80;

/// Render a byte count with the largest unit not exceeding it.
///
/// ```
/// use bi_utils::system::verbose_size;
///
/// assert_eq!(verbose_size(1), "1B");
/// assert_eq!(verbose_size(73856), "72.12KB");
/// assert_eq!(verbose_size(2048), "2.0KB");
/// ```
#[must_use]
pub fn verbose_size(size_bytes: u64) -> String {
    verbose_size_with(size_bytes, UNITS)
}

/// [`verbose_size`] with custom units, ordered from largest to smallest.
///
/// Sizes below every unit are rendered with the last one.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn verbose_size_with(size_bytes: u64, units: &[(&str, u64)]) -> String {
    let Some(&(suffix, factor)) = units
        .iter()
        .find(|(_, factor)| size_bytes >= *factor)
        .or_else(|| units.last())
    else {
        return size_bytes.to_string();
    };
    if factor == 1 {
        return format!("{size_bytes}{suffix}");
    }
    let amount = size_bytes as f64 / factor as f64;
    format!("{}{suffix}", format_amount(amount))
}

// Two decimals at most, always with a decimal point
fn format_amount(amount: f64) -> String {
    let rounded: f64 = format!("{amount:.2}").parse().unwrap_or(amount);
    if rounded.fract() == 0.0 {
        format!("{rounded:.1}")
    } else {
        rounded.to_string()
    }
}

/// Center ` message ` in the terminal, padding it with `fill_char`.
///
/// The width is the `COLUMNS` environment variable (80 when unset) minus
/// `prefix_width`, leaving room for a log prefix.
#[must_use]
pub fn fill_message(message: &str, fill_char: char, prefix_width: usize) -> String {
    let width = terminal_width().saturating_sub(prefix_width);
    center(&format!(" {message} "), width, fill_char)
}

fn terminal_width() -> usize {
    std::env::var("COLUMNS")
        .ok()
        .and_then(|cols| cols.trim().parse().ok())
        .unwrap_or(DEFAULT_TERMINAL_WIDTH)
}

fn center(text: &str, width: usize, fill_char: char) -> String {
    let len = text.chars().count();
    if width <= len {
        return text.to_string();
    }
    let margin = width - len;
    // Odd margins put the extra char on the left only when the width is odd
    let left = margin / 2 + (margin & width & 1);
    let right = margin - left;
    let fill = fill_char.to_string();
    format!("{}{text}{}", fill.repeat(left), fill.repeat(right))
}

/// Physical memory used by the current process, e.g. `"35.4MB"`.
///
/// # Errors
///
/// Returns an error if the process cannot be inspected on this platform.
pub fn ram_usage() -> Result<String> {
    let pid = sysinfo::get_current_pid().map_err(Error::internal)?;
    let mut system = System::new();
    system.refresh_process(pid);
    let process = system
        .process(pid)
        .ok_or_else(|| Error::internal(format!("process {pid} not found")))?;
    Ok(verbose_size(process.memory()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_size() {
        assert_eq!(verbose_size(1), "1B");
        assert_eq!(verbose_size(73_856), "72.12KB");
        assert_eq!(verbose_size(374_563_485), "357.21MB");
        assert_eq!(verbose_size(678_426_357_923), "631.83GB");
        assert_eq!(verbose_size(8_293_576_827_356_345), "7.37PB");
    }

    #[test]
    fn test_verbose_size_edges() {
        assert_eq!(verbose_size(0), "0B");
        assert_eq!(verbose_size(1023), "1023B");
        assert_eq!(verbose_size(1024), "1.0KB");
        assert_eq!(verbose_size(1536), "1.5KB");
    }

    #[test]
    fn test_verbose_size_custom_units() {
        let units = [("k", 1000), ("", 1)];
        assert_eq!(verbose_size_with(2500, &units), "2.5k");
        assert_eq!(verbose_size_with(999, &units), "999");
        assert_eq!(verbose_size_with(7, &[]), "7");
    }

    #[test]
    fn test_center_matches_str_center() {
        assert_eq!(center(" hi ", 10, '='), "=== hi ===");
        // odd margin, odd width: extra fill on the left
        assert_eq!(center(" hi ", 9, '='), "=== hi ==");
        // odd margin, even width: extra fill on the right
        assert_eq!(center(" abc ", 10, '='), "== abc ===");
        assert_eq!(center(" long message ", 4, '='), " long message ");
    }

    #[test]
    fn test_fill_message_width() {
        let message = fill_message("Start", '-', 0);
        assert!(message.contains(" Start "));
        assert!(message.starts_with('-'));
        assert!(message.chars().count() >= " Start ".len());
    }

    #[test]
    fn test_ram_usage() {
        let ram = ram_usage().unwrap();
        assert!(ram.ends_with('B'));
    }
}
