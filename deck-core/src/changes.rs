//! Partial changes and the field-level merge rule.
//!
//! A change carries only the fields that were edited. Applying it
//! overwrites exactly those fields; everything else is retained.
//! Encoded sub-structures are decoded on apply and a malformed blob
//! leaves the previous parsed value in place.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{self, encode_value, merge_blob};
use crate::model::{
    Element, ElementContent, ElementKind, FrameId, FramePosition, Frame, Position,
    TransitionSettings, AnimationSettings,
};

/// Partial update of an element, as carried by `element_update` and
/// `PATCH /elements/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementChanges {
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
    /// Moves the element to another frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameId>,
}

impl ElementChanges {
    pub fn position(position: &Position) -> Self {
        Self {
            position: Some(encode_value(position)),
            ..Self::default()
        }
    }

    pub fn content(content: &ElementContent) -> Self {
        Self {
            content: Some(encode_value(content)),
            ..Self::default()
        }
    }

    pub fn animation(settings: &AnimationSettings) -> Self {
        Self {
            animation_settings: Some(encode_value(settings)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.element_type.is_none()
            && self.position.is_none()
            && self.content.is_none()
            && self.animation_settings.is_none()
            && self.link_url.is_none()
            && self.frame.is_none()
    }

    /// Fold a newer change into this one; fields present in `newer` win.
    pub fn merge(&mut self, newer: ElementChanges) {
        if newer.element_type.is_some() {
            self.element_type = newer.element_type;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
        if newer.animation_settings.is_some() {
            self.animation_settings = newer.animation_settings;
        }
        if newer.link_url.is_some() {
            self.link_url = newer.link_url;
        }
        if newer.frame.is_some() {
            self.frame = newer.frame;
        }
    }

    /// Decoded position, if this change carries a valid one.
    pub fn decoded_position(&self) -> Option<Position> {
        self.position
            .as_ref()
            .and_then(|blob| codec::decode::<Position>("position", blob).ok())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Partial update of a frame, as carried by `frame_update` and
/// `PATCH /frames/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
    #[serde(default, alias = "order_index", skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_settings: Option<Value>,
}

impl FrameChanges {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn position(position: &FramePosition) -> Self {
        Self {
            position: Some(encode_value(position)),
            ..Self::default()
        }
    }

    pub fn transition(settings: &TransitionSettings) -> Self {
        Self {
            transition_settings: Some(encode_value(settings)),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.position.is_none()
            && self.background_color.is_none()
            && self.background_image.is_none()
            && self.order.is_none()
            && self.transition_settings.is_none()
    }

    pub fn merge(&mut self, newer: FrameChanges) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.background_color.is_some() {
            self.background_color = newer.background_color;
        }
        if newer.background_image.is_some() {
            self.background_image = newer.background_image;
        }
        if newer.order.is_some() {
            self.order = newer.order;
        }
        if newer.transition_settings.is_some() {
            self.transition_settings = newer.transition_settings;
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Element {
    /// Field-merge `changes` into this element.
    ///
    /// The frame move (`changes.frame`) is not applied here; relocating an
    /// element between frames is the store's job.
    pub(crate) fn merge_changes(&mut self, changes: &ElementChanges) {
        if let Some(kind) = changes.element_type {
            if kind != self.kind {
                self.kind = kind;
                // Old payload belongs to another variant.
                self.content = ElementContent::default_for(kind);
            }
        }
        if let Some(blob) = &changes.position {
            self.position = merge_blob("position", &self.position, blob).clamped();
        }
        if let Some(blob) = &changes.content {
            match ElementContent::decode(self.kind, blob) {
                Ok(content) => self.content = content,
                Err(e) => log::warn!("Keeping previous content of element {}: {e}", self.id),
            }
        }
        if let Some(blob) = &changes.animation_settings {
            self.animation = merge_blob("animation settings", &self.animation, blob);
        }
        if let Some(url) = &changes.link_url {
            self.link_url = url.clone();
        }
    }
}

impl Frame {
    pub(crate) fn merge_changes(&mut self, changes: &FrameChanges) {
        if let Some(title) = &changes.title {
            self.title = title.clone();
        }
        if let Some(blob) = &changes.position {
            self.position = merge_blob("frame position", &self.position, blob).clamped();
        }
        if let Some(color) = &changes.background_color {
            self.background_color = color.clone();
        }
        if let Some(image) = &changes.background_image {
            self.background_image = image.clone();
        }
        if let Some(order) = changes.order {
            self.order = order;
        }
        if let Some(blob) = &changes.transition_settings {
            self.transition = merge_blob("transition settings", &self.transition, blob);
        }
    }
}
