use console::style;

/// Renders a simple `[====    ]`-style ASCII progress bar, used by the
/// quiet/verbose output modes where a full indicatif bar would be noise.
pub(crate) fn progress_bar(progress_current: usize, progress_total: usize, width: usize) -> String {
    let width = width.saturating_sub(2).max(1);
    let progress = if progress_total == 0 { 0.0 } else { progress_current as f64 / progress_total as f64 };
    let filled_length = ((width as f64 * progress).round() as usize).min(width);
    let bar = "=".repeat(filled_length) + &" ".repeat(width - filled_length);
    style(format!("[{bar}]")).dim().to_string()
}

#[cfg(test)]
mod tests {
    use super::progress_bar;

    #[test]
    fn half_full() {
        let bar = console::strip_ansi_codes(&progress_bar(5, 10, 12)).to_string();
        assert_eq!(bar, "[=====     ]");
    }

    #[test]
    fn zero_total_does_not_panic() {
        let _ = progress_bar(0, 0, 10);
    }
}
