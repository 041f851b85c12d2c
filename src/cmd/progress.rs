//! Terminal spinner that follows task events on the bus.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use codeloop::bus::{Event, EventBus, EventKind, NotificationLevel, Subscription};

pub struct TaskProgress {
    bar: ProgressBar,
    subscriptions: Vec<Subscription>,
}

impl TaskProgress {
    /// Start the spinner and subscribe it to task, iteration and notification
    /// events. `verbose` also prints run output lines.
    pub fn start(bus: &EventBus, label: &str, verbose: bool) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(spinner) = ProgressStyle::default_spinner().template("{spinner} {prefix:.bold.dim} {msg}") {
            bar.set_style(spinner);
        }
        bar.set_prefix(label.to_string());
        bar.set_message("starting");
        bar.enable_steady_tick(Duration::from_millis(100));

        let mut subscriptions = Vec::new();

        let b = bar.clone();
        subscriptions.push(bus.subscribe(EventKind::TaskUpdated, move |event| {
            if let Event::TaskUpdated { status, .. } = event {
                b.set_message(status.to_string());
            }
            Ok(())
        }));

        let b = bar.clone();
        subscriptions.push(bus.subscribe(EventKind::TaskIteration, move |event| {
            if let Event::TaskIteration { iteration, error, .. } = event {
                let line = match error {
                    Some(error) => format!("  {} iteration {}: {}", style("✗").red(), iteration, error),
                    None => format!("  {} iteration {}: clean run", style("✓").green(), iteration),
                };
                b.println(line);
                b.set_message(format!("iteration {} done", iteration));
            }
            Ok(())
        }));

        let b = bar.clone();
        subscriptions.push(bus.subscribe(EventKind::Notification, move |event| {
            if let Event::Notification { level, message, .. } = event {
                let marker = match level {
                    NotificationLevel::Info => style("ℹ").blue(),
                    NotificationLevel::Warning => style("⚠").yellow(),
                    NotificationLevel::Error => style("✗").red(),
                };
                b.println(format!("  {} {}", marker, message));
            }
            Ok(())
        }));

        let b = bar.clone();
        subscriptions.push(bus.subscribe(EventKind::RunStarted, move |event| {
            if let Event::RunStarted { entry, .. } = event {
                b.set_message(format!("running {}", entry));
            }
            Ok(())
        }));

        if verbose {
            let b = bar.clone();
            subscriptions.push(bus.subscribe(EventKind::RunOutput, move |event| {
                if let Event::RunOutput { text, .. } = event {
                    for line in text.lines() {
                        b.println(format!("    {}", style(line).dim()));
                    }
                }
                Ok(())
            }));
        }

        Self { bar, subscriptions }
    }

    pub fn set_message(&self, msg: impl Into<String>) {
        self.bar.set_message(msg.into());
    }

    /// Stop the spinner and detach it from the bus.
    pub fn finish(self, msg: impl Into<String>) {
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        self.bar.finish_with_message(msg.into());
    }
}
