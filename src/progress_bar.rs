pub use crate::traits::Progress;

impl Progress for indicatif::ProgressBar {
    fn inc(&self, i: u64) {
        indicatif::ProgressBar::inc(self, i)
    }

    fn finish(&self) {
        indicatif::ProgressBar::finish(self)
    }
}

impl Progress for logbar::ProgressBar {
    fn inc(&self, i: u64) {
        logbar::ProgressBar::inc(self, i as usize)
    }

    fn finish(&self) {
        logbar::ProgressBar::finish(self)
    }
}

/// Dummy progress indicator
pub struct NoProgress {}
impl Progress for NoProgress {
    fn inc(&self, _i: u64) {}

    fn finish(&self) {}
}

/// Progress bar for long-running loops such as pseudo-experiments
///
/// On an interactive terminal an [indicatif] bar is shown, otherwise a
/// [logbar] one. Logging is suspended while the bar is active. If the
/// log level is not `Info`, no bar is shown at all.
pub struct ProgressBar {
    bar: Box<dyn Progress + Send + Sync>,
    /// Log level to restore when the bar is finished
    suspended_level: Option<log::LevelFilter>,
}

impl Default for ProgressBar {
    fn default() -> Self {
        Self {
            bar: Box::new(NoProgress {}),
            suspended_level: None,
        }
    }
}

impl Progress for ProgressBar {
    fn inc(&self, i: u64) {
        self.bar.inc(i);
    }

    fn finish(&self) {
        self.bar.finish();
        if let Some(level) = self.suspended_level {
            log::set_max_level(level);
        }
    }
}

impl ProgressBar {
    pub fn new(len: u64, message: &str) -> Self {
        if log::max_level().to_level() != Some(log::Level::Info) {
            return ProgressBar::default();
        }
        let bar: Box<dyn Progress + Send + Sync> =
            if console::Term::stderr().features().is_attended() {
                let bar = indicatif::ProgressBar::new(len);
                let style = indicatif::ProgressStyle::default_bar()
                    .template("{bar:60.cyan/cyan} {msg} {pos}/{len} [{elapsed}, ETA {eta}]");
                if let Ok(style) = style {
                    bar.set_style(style);
                }
                bar.set_message(message.to_owned());
                Box::new(bar)
            } else {
                eprintln!("{message}");
                let style = logbar::Style::new().indicator('█');
                Box::new(logbar::ProgressBar::with_style(len as usize, style))
            };
        let suspended_level = Some(log::max_level());
        log::set_max_level(log::LevelFilter::Off);
        ProgressBar {
            bar,
            suspended_level,
        }
    }
}
