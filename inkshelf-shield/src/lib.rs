use std::time::{Duration, Instant};

use crossterm::event::{KeyCode, KeyModifiers, ModifierKeyCode};
use tracing::debug;

/// Replaces all visible output when a print is attempted.
pub const PRINT_NOTICE: &str =
    "This book is protected. Printed copies are not available for this title.";

/// Input signals the engine evaluates. Key events use the platform input
/// model; the viewport sample is a polled condition, not an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    KeyPress {
        code: KeyCode,
        modifiers: KeyModifiers,
    },
    KeyRelease {
        code: KeyCode,
        modifiers: KeyModifiers,
    },
    ContextMenu,
    DragStart,
    Drop,
    FocusLost,
    FocusGained,
    VisibilityHidden,
    VisibilityVisible,
    Viewport(ViewportSample),
}

/// Inner content area versus the outer window, polled at a fixed interval.
/// A sustained discrepancy beyond the configured slack suggests an attached
/// inspector pane or capture chrome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSample {
    pub inner_width: u32,
    pub inner_height: u32,
    pub outer_width: u32,
    pub outer_height: u32,
}

/// What a matched trigger does. Composable per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Response {
    pub block_default: bool,
    pub show_message: bool,
    pub blur_for: Option<Duration>,
}

/// One detection rule: a predicate over key input plus its response.
pub struct TriggerRule {
    pub name: &'static str,
    matcher: fn(KeyCode, KeyModifiers) -> bool,
    pub response: Response,
}

/// Outcome of evaluating a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub block_default: bool,
    pub rule: Option<&'static str>,
}

impl Verdict {
    fn pass() -> Self {
        Self {
            block_default: false,
            rule: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShieldStatus {
    pub content_blurred: bool,
    pub message_visible: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ShieldConfig {
    pub message_duration: Duration,
    pub screenshot_blur: Duration,
    pub preemptive_blur: Duration,
    pub focus_restore_delay: Duration,
    pub viewport_slack: u32,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            message_duration: Duration::from_millis(2000),
            screenshot_blur: Duration::from_millis(1500),
            preemptive_blur: Duration::from_millis(2000),
            focus_restore_delay: Duration::from_millis(300),
            viewport_slack: 160,
        }
    }
}

fn is_char(code: KeyCode, expected: char) -> bool {
    matches!(code, KeyCode::Char(c) if c.eq_ignore_ascii_case(&expected))
}

fn clipboard_or_export(code: KeyCode, mods: KeyModifiers) -> bool {
    if !mods.contains(KeyModifiers::CONTROL) || mods.contains(KeyModifiers::SHIFT) {
        return false;
    }
    ['c', 'x', 'p', 's', 'a'].iter().any(|&c| is_char(code, c))
}

fn inspector_shortcut(code: KeyCode, mods: KeyModifiers) -> bool {
    if code == KeyCode::F(12) {
        return true;
    }
    if mods.contains(KeyModifiers::CONTROL) && mods.contains(KeyModifiers::SHIFT) {
        return ['i', 'j', 'c'].iter().any(|&c| is_char(code, c));
    }
    mods.contains(KeyModifiers::CONTROL) && is_char(code, 'u')
}

fn print_screen(code: KeyCode, mods: KeyModifiers) -> bool {
    code == KeyCode::PrintScreen && !mods.contains(KeyModifiers::CONTROL)
}

fn snipping_shortcut(code: KeyCode, mods: KeyModifiers) -> bool {
    let super_shift = mods.contains(KeyModifiers::SUPER) && mods.contains(KeyModifiers::SHIFT);
    (super_shift && is_char(code, 's'))
        || (code == KeyCode::PrintScreen && mods.contains(KeyModifiers::CONTROL))
}

/// Best-effort deterrence against casual content extraction. Every effect is
/// a transient UI state driven by deadlines; the engine owns no threads and
/// is advanced by passing the current instant into `evaluate` and `status`.
pub struct ShieldEngine {
    config: ShieldConfig,
    rules: Vec<TriggerRule>,
    message_until: Option<Instant>,
    blur_until: Option<Instant>,
    focus_blurred: bool,
    focus_restore_at: Option<Instant>,
    viewport_breached: bool,
    screenshot_combo_held: bool,
}

impl ShieldEngine {
    pub fn new(config: ShieldConfig) -> Self {
        let rules = vec![
            TriggerRule {
                name: "clipboard-export",
                matcher: clipboard_or_export,
                response: Response {
                    block_default: true,
                    show_message: true,
                    blur_for: None,
                },
            },
            TriggerRule {
                name: "inspector",
                matcher: inspector_shortcut,
                response: Response {
                    block_default: true,
                    show_message: true,
                    blur_for: None,
                },
            },
            TriggerRule {
                name: "print-screen",
                matcher: print_screen,
                response: Response {
                    block_default: true,
                    show_message: true,
                    blur_for: Some(config.screenshot_blur),
                },
            },
            TriggerRule {
                name: "snipping-tool",
                matcher: snipping_shortcut,
                response: Response {
                    block_default: true,
                    show_message: true,
                    blur_for: Some(config.screenshot_blur),
                },
            },
        ];
        Self {
            config,
            rules,
            message_until: None,
            blur_until: None,
            focus_blurred: false,
            focus_restore_at: None,
            viewport_breached: false,
            screenshot_combo_held: false,
        }
    }

    pub fn rules(&self) -> &[TriggerRule] {
        &self.rules
    }

    /// Feeds one signal through the rule table and the stateful heuristics.
    /// Never panics; unmatched signals pass through untouched.
    pub fn evaluate(&mut self, signal: InputSignal, now: Instant) -> Verdict {
        match signal {
            InputSignal::KeyPress { code, modifiers } => self.on_key_press(code, modifiers, now),
            InputSignal::KeyRelease { code, modifiers } => {
                self.on_key_release(code, modifiers);
                Verdict::pass()
            }
            InputSignal::ContextMenu => {
                self.show_message(now);
                Verdict {
                    block_default: true,
                    rule: Some("context-menu"),
                }
            }
            InputSignal::DragStart | InputSignal::Drop => Verdict {
                // Blocked unconditionally, no UI feedback.
                block_default: true,
                rule: Some("drag-drop"),
            },
            InputSignal::FocusLost | InputSignal::VisibilityHidden => {
                self.focus_blurred = true;
                self.focus_restore_at = None;
                Verdict::pass()
            }
            InputSignal::FocusGained | InputSignal::VisibilityVisible => {
                if self.focus_blurred {
                    // Short delay before restoring, so quick legitimate focus
                    // changes do not flicker.
                    self.focus_restore_at = Some(now + self.config.focus_restore_delay);
                }
                Verdict::pass()
            }
            InputSignal::Viewport(sample) => {
                self.on_viewport_sample(sample, now);
                Verdict::pass()
            }
        }
    }

    fn on_key_press(&mut self, code: KeyCode, modifiers: KeyModifiers, now: Instant) -> Verdict {
        // Plain terminals deliver no key-release events, so a press whose
        // modifiers no longer include the chord also re-arms the heuristic.
        if self.screenshot_combo_held
            && !(modifiers.contains(KeyModifiers::SUPER)
                && modifiers.contains(KeyModifiers::SHIFT))
        {
            self.screenshot_combo_held = false;
        }

        for rule in &self.rules {
            if (rule.matcher)(code, modifiers) {
                debug!(rule = rule.name, "protection trigger matched");
                if rule.response.show_message {
                    self.message_until = Some(now + self.config.message_duration);
                }
                if let Some(duration) = rule.response.blur_for {
                    self.blur_until = Some(now + duration);
                }
                return Verdict {
                    block_default: rule.response.block_default,
                    rule: Some(rule.name),
                };
            }
        }

        // The browser still sees the modifier keydowns of an OS screenshot
        // chord even when the final key is swallowed. Blur preemptively the
        // first time both modifiers are down, then hold fire until released.
        if modifiers.contains(KeyModifiers::SUPER) && modifiers.contains(KeyModifiers::SHIFT) {
            if !self.screenshot_combo_held {
                self.screenshot_combo_held = true;
                self.blur_until = Some(now + self.config.preemptive_blur);
                self.show_message(now);
            }
            return Verdict {
                block_default: false,
                rule: Some("os-screenshot-combo"),
            };
        }

        Verdict::pass()
    }

    fn on_key_release(&mut self, code: KeyCode, modifiers: KeyModifiers) {
        if !self.screenshot_combo_held {
            return;
        }
        let released_modifier = matches!(
            code,
            KeyCode::Modifier(
                ModifierKeyCode::LeftShift
                    | ModifierKeyCode::RightShift
                    | ModifierKeyCode::LeftSuper
                    | ModifierKeyCode::RightSuper
            )
        );
        let combo_down =
            modifiers.contains(KeyModifiers::SUPER) && modifiers.contains(KeyModifiers::SHIFT);
        if released_modifier || !combo_down {
            self.screenshot_combo_held = false;
        }
    }

    fn on_viewport_sample(&mut self, sample: ViewportSample, now: Instant) {
        let slack = self.config.viewport_slack;
        let breached = sample.outer_width.saturating_sub(sample.inner_width) > slack
            || sample.outer_height.saturating_sub(sample.inner_height) > slack;

        if breached && !self.viewport_breached {
            // Message fires on the rising edge only; the blur is the
            // sustained condition itself.
            self.show_message(now);
        }
        self.viewport_breached = breached;
    }

    fn show_message(&mut self, now: Instant) {
        // Single timer per effect: a new trigger resets it, never stacks.
        self.message_until = Some(now + self.config.message_duration);
    }

    /// Current transient UI state. Deadlines that have passed are cleared as
    /// a side effect; the caller polls this each frame.
    pub fn status(&mut self, now: Instant) -> ShieldStatus {
        if let Some(at) = self.focus_restore_at {
            if at <= now {
                self.focus_blurred = false;
                self.focus_restore_at = None;
            }
        }
        if let Some(until) = self.blur_until {
            if until <= now {
                self.blur_until = None;
            }
        }
        if let Some(until) = self.message_until {
            if until <= now {
                self.message_until = None;
            }
        }

        ShieldStatus {
            content_blurred: self.blur_until.is_some()
                || self.focus_blurred
                || self.viewport_breached,
            message_visible: self.message_until.is_some(),
        }
    }
}

impl Default for ShieldEngine {
    fn default() -> Self {
        Self::new(ShieldConfig::default())
    }
}

/// Compact owner identifier used as the repeated watermark tile.
pub fn watermark_tile(owner_address: &str) -> String {
    let total = owner_address.chars().count();
    if total <= 12 {
        return owner_address.to_string();
    }
    let head: String = owner_address.chars().take(6).collect();
    let tail: String = owner_address
        .chars()
        .skip(total.saturating_sub(4))
        .collect();
    format!("{head}..{tail}")
}

/// A full line of tiled watermark text for a surface of the given width.
pub fn watermark_band(owner_address: &str, width: usize) -> String {
    let tile = watermark_tile(owner_address);
    if tile.is_empty() || width == 0 {
        return String::new();
    }
    let mut band = String::new();
    while band.chars().count() < width {
        band.push_str(&tile);
        band.push_str("   ");
    }
    band.chars().take(width).collect()
}
