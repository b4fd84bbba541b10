use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::watch;

/// Visible state of the "new task available" control.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ElementMarkers {
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub classes: Vec<String>,
}

impl ElementMarkers {
    pub fn enabled() -> Self {
        Self {
            classes: vec!["enabled".to_string()],
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::default()
        }
    }

    /// The control counts as disabled unless it is enabled, visible and
    /// carries the `enabled` class.
    pub fn is_disabled(&self) -> bool {
        self.disabled || self.hidden || !self.classes.iter().any(|c| c == "enabled")
    }
}

/// A located element: an identity plus a feed of marker changes.
///
/// The receiver errors once the element is gone or replaced.
#[derive(Debug)]
pub struct WatchedElement {
    pub id: u64,
    pub markers: watch::Receiver<ElementMarkers>,
}

impl WatchedElement {
    /// Current state, marking it seen.
    pub fn is_disabled(&mut self) -> bool {
        self.markers.borrow_and_update().is_disabled()
    }
}

/// Finds the watched element in whatever hosts it.
pub trait ElementLocator: Send + Sync {
    fn locate(&self) -> Option<WatchedElement>;
}

/// A locator fed from outside: the current element and its markers are
/// pushed in with [`SharedLocator::publish`].
#[derive(Clone, Default)]
pub struct SharedLocator {
    current: Arc<Mutex<Option<(u64, watch::Sender<ElementMarkers>)>>>,
}

/// One line of the element feed.
#[derive(Debug, Deserialize)]
struct FeedElement {
    id: u64,
    #[serde(flatten)]
    markers: ElementMarkers,
}

impl SharedLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the element's markers. A new `id` replaces the element, which
    /// closes the feed of anyone watching the old one.
    pub fn publish(&self, id: u64, markers: ElementMarkers) {
        let mut current = self.current.lock();
        match current.as_ref() {
            Some((current_id, tx)) if *current_id == id => {
                tx.send_replace(markers);
            }
            _ => {
                let (tx, _) = watch::channel(markers);
                *current = Some((id, tx));
            }
        }
    }

    /// The element left the page.
    pub fn remove(&self) {
        self.current.lock().take();
    }

    /// Apply one line of the JSON element feed: an object publishes,
    /// `null` removes, blank lines are skipped.
    pub fn apply_feed_line(&self, line: &str) -> Result<(), serde_json::Error> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }
        match serde_json::from_str::<Option<FeedElement>>(line)? {
            Some(element) => {
                tracing::trace!(id = element.id, disabled = element.markers.is_disabled(), "element update");
                self.publish(element.id, element.markers);
            }
            None => {
                tracing::trace!("element removed");
                self.remove();
            }
        }
        Ok(())
    }
}

impl ElementLocator for SharedLocator {
    fn locate(&self) -> Option<WatchedElement> {
        self.current.lock().as_ref().map(|(id, tx)| WatchedElement {
            id: *id,
            markers: tx.subscribe(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_unless_enabled_visible_and_classed() {
        assert!(ElementMarkers::disabled().is_disabled());
        assert!(!ElementMarkers::enabled().is_disabled());
        assert!(ElementMarkers::default().is_disabled());

        let hidden = ElementMarkers {
            hidden: true,
            ..ElementMarkers::enabled()
        };
        assert!(hidden.is_disabled());

        let both = ElementMarkers {
            disabled: true,
            ..ElementMarkers::enabled()
        };
        assert!(both.is_disabled());
    }

    #[test]
    fn same_id_updates_in_place() {
        let locator = SharedLocator::new();
        locator.publish(1, ElementMarkers::disabled());
        let mut element = locator.locate().unwrap();
        assert!(element.is_disabled());

        locator.publish(1, ElementMarkers::enabled());
        assert!(element.markers.has_changed().unwrap());
        assert!(!element.is_disabled());
    }

    #[test]
    fn new_id_closes_old_feed() {
        let locator = SharedLocator::new();
        locator.publish(1, ElementMarkers::disabled());
        let element = locator.locate().unwrap();

        locator.publish(2, ElementMarkers::enabled());
        assert!(element.markers.has_changed().is_err());
        assert_eq!(locator.locate().unwrap().id, 2);
    }

    #[test]
    fn feed_lines_publish_and_remove() {
        let locator = SharedLocator::new();
        locator
            .apply_feed_line(r#"{"id": 7, "disabled": false, "hidden": false, "classes": ["btn", "enabled"]}"#)
            .unwrap();
        let mut element = locator.locate().unwrap();
        assert_eq!(element.id, 7);
        assert!(!element.is_disabled());

        locator.apply_feed_line("   ").unwrap();
        assert!(locator.locate().is_some());

        locator.apply_feed_line("null").unwrap();
        assert!(locator.locate().is_none());

        assert!(locator.apply_feed_line("{\"disabled\": true}").is_err());
    }
}
