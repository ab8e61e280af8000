/*
 * Copyright (c) 2022 McSib
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing::warn;

use crate::pexels::{EndReason, SessionEvent, StatusLevel};

/// Resolution of the overall bar. Session progress arrives as a fraction.
const OVERALL_STEPS: u64 = 1000;

const OVERALL_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:>3}% {msg}";
const CATEGORY_TEMPLATE: &str = "  {prefix:>16.bold} [{bar:30.green/white}] {pos}/{len}";
const FALLBACK_TEMPLATE: &str = "{spinner} [{elapsed_precise}] {bar} {pos}/{len}";

/// A builder that helps in making a new [ProgressStyle] for use.
pub(crate) struct ProgressStyleBuilder {
    progress_style: ProgressStyle,
}

impl ProgressStyleBuilder {
    /// Sets the template of the progress style, falling back to a plain bar if it is rejected.
    pub(crate) fn template(mut self, msg_template: &str) -> Self {
        self.progress_style = match self.progress_style.clone().template(msg_template) {
            Ok(style) => style,
            Err(err) => {
                warn!("Template error with '{}': {}. Using fallback template.", msg_template, err);
                ProgressStyle::default_bar()
                    .template(FALLBACK_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
            }
        };
        self
    }

    pub(crate) fn progress_chars(mut self, chars: &str) -> Self {
        self.progress_style = self.progress_style.progress_chars(chars);
        self
    }

    pub(crate) fn build(self) -> ProgressStyle {
        self.progress_style
    }
}

impl Default for ProgressStyleBuilder {
    fn default() -> Self {
        Self {
            progress_style: ProgressStyle::default_bar(),
        }
    }
}

/// Terminal view of one download session.
///
/// One overall bar driven by [`SessionEvent::Progress`] plus one bar per category driven by
/// [`SessionEvent::CategoryProgress`]. Status lines are printed above the bars.
pub(crate) struct SessionView {
    multi: MultiProgress,
    overall: ProgressBar,
    categories: HashMap<String, ProgressBar>,
}

impl SessionView {
    pub(crate) fn new(categories: &[String], target: u32) -> Self {
        Self::with_draw_target(categories, target, ProgressDrawTarget::stderr())
    }

    pub(crate) fn with_draw_target(
        categories: &[String],
        target: u32,
        draw_target: ProgressDrawTarget,
    ) -> Self {
        let multi = MultiProgress::with_draw_target(draw_target);

        let overall = multi.add(ProgressBar::new(OVERALL_STEPS));
        overall.set_style(
            ProgressStyleBuilder::default()
                .template(OVERALL_TEMPLATE)
                .progress_chars("=>-")
                .build(),
        );
        overall.set_message("Downloading");
        overall.enable_steady_tick(Duration::from_millis(100));

        let category_style = ProgressStyleBuilder::default()
            .template(CATEGORY_TEMPLATE)
            .progress_chars("#>-")
            .build();

        let mut bars = HashMap::new();
        for category in categories {
            bars.entry(category.clone()).or_insert_with(|| {
                let bar = multi.add(ProgressBar::new(target as u64));
                bar.set_style(category_style.clone());
                bar.set_prefix(category.clone());
                bar
            });
        }

        Self {
            multi,
            overall,
            categories: bars,
        }
    }

    /// Renders one event. Returns the end reason once the session is over.
    pub(crate) fn apply(&self, event: &SessionEvent) -> Option<EndReason> {
        match event {
            SessionEvent::Status { level, category, message } => {
                let _ = self.multi.println(status_line(*level, category.as_deref(), message));
                None
            }
            SessionEvent::CategoryProgress { category, downloaded, .. } => {
                if let Some(bar) = self.categories.get(category) {
                    bar.set_position(*downloaded as u64);
                }
                None
            }
            SessionEvent::Progress(fraction) => {
                self.overall.set_position((fraction * OVERALL_STEPS as f64).round() as u64);
                None
            }
            SessionEvent::SessionEnd(reason) => {
                self.finish(*reason);
                Some(*reason)
            }
        }
    }

    pub(crate) fn overall_position(&self) -> u64 {
        self.overall.position()
    }

    fn finish(&self, reason: EndReason) {
        for bar in self.categories.values() {
            bar.abandon();
        }
        match reason {
            EndReason::Completed => self.overall.finish_with_message("Completed"),
            EndReason::Stopped => self.overall.abandon_with_message("Stopped"),
        }
    }
}

/// Formats a status line the way the shell prints it.
pub(crate) fn status_line(level: StatusLevel, category: Option<&str>, message: &str) -> String {
    let text = match category {
        Some(category) => format!("[{}] {}", category, message),
        None => message.to_string(),
    };
    match level {
        StatusLevel::Info => style(text).to_string(),
        StatusLevel::Warning => style(text).yellow().to_string(),
        StatusLevel::Error => style(text).red().bold().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hidden_view(categories: &[&str], target: u32) -> SessionView {
        let categories: Vec<String> = categories.iter().map(|c| c.to_string()).collect();
        SessionView::with_draw_target(&categories, target, ProgressDrawTarget::hidden())
    }

    #[test]
    fn test_progress_fraction_maps_to_overall_bar() {
        let view = hidden_view(&["cats"], 10);

        assert_eq!(view.apply(&SessionEvent::Progress(0.25)), None);
        assert_eq!(view.overall_position(), 250);

        assert_eq!(view.apply(&SessionEvent::Progress(1.0)), None);
        assert_eq!(view.overall_position(), OVERALL_STEPS);
    }

    #[test]
    fn test_category_progress_updates_matching_bar() {
        let view = hidden_view(&["cats", "dogs", "cats"], 5);
        assert_eq!(view.categories.len(), 2);

        view.apply(&SessionEvent::CategoryProgress {
            category: "dogs".to_string(),
            downloaded: 3,
            target: 5,
        });

        assert_eq!(view.categories["dogs"].position(), 3);
        assert_eq!(view.categories["cats"].position(), 0);
    }

    #[test]
    fn test_session_end_is_reported() {
        let view = hidden_view(&["cats"], 1);

        assert_eq!(
            view.apply(&SessionEvent::SessionEnd(EndReason::Stopped)),
            Some(EndReason::Stopped)
        );
    }

    #[test]
    fn test_status_line_carries_category_and_message() {
        let line = status_line(StatusLevel::Warning, Some("cats"), "Error downloading 7: timeout");
        assert!(line.contains("[cats] Error downloading 7: timeout"));

        let plain = status_line(StatusLevel::Info, None, "Total images to download: 20");
        assert!(plain.contains("Total images to download: 20"));
    }

    #[test]
    fn test_style_builder_produces_usable_style() {
        let style = ProgressStyleBuilder::default()
            .template(CATEGORY_TEMPLATE)
            .progress_chars("#>-")
            .build();
        let bar = ProgressBar::with_draw_target(Some(1), ProgressDrawTarget::hidden());
        bar.set_style(style);
        bar.inc(1);
        assert_eq!(bar.position(), 1);
    }
}
