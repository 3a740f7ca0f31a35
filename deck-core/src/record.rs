//! Wire records for snapshot hydration and creates.
//!
//! The server of record returns presentations as nested JSON where every
//! sub-structure may appear as an encoded blob (`position`), as an already
//! parsed object (`position_parsed`), both, or neither. Hydration prefers the
//! blob, then the parsed value, then the documented default.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::{self, encode_value};
use crate::model::{
    AnimationSettings, CanvasSettings, Element, ElementContent, ElementId, ElementKind, Frame,
    FrameId, FramePosition, Permission, Position, Presentation, PresentationId, PresentationInfo,
    TransitionSettings,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is missing required field `{0}`")]
    MissingField(&'static str),
}

/// Blob, then parsed value, then default.
fn resolve<T>(what: &'static str, blob: Option<&Value>, parsed: Option<&T>) -> T
where
    T: DeserializeOwned + Default + Clone,
{
    if let Some(blob) = blob.filter(|b| !b.is_null()) {
        match codec::decode(what, blob) {
            Ok(value) => return value,
            Err(e) => log::warn!("Falling back for {what}: {e}"),
        }
    }
    parsed.cloned().unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ElementId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameId>,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub element_type: Option<ElementKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_parsed: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_parsed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub animation_settings_parsed: Option<AnimationSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
}

impl ElementRecord {
    pub fn from_element(element: &Element) -> Self {
        Self {
            id: Some(element.id),
            frame: Some(element.frame_id),
            element_type: Some(element.kind),
            position: Some(encode_value(&element.position)),
            content: Some(encode_value(&element.content)),
            animation_settings: Some(encode_value(&element.animation)),
            link_url: Some(element.link_url.clone()),
            ..Self::default()
        }
    }

    /// Body for `POST /elements/`; the server assigns the id.
    pub fn draft(frame: FrameId, content: &ElementContent, position: &Position) -> Self {
        Self {
            frame: Some(frame),
            element_type: Some(content.kind()),
            position: Some(encode_value(&position.clamped())),
            content: Some(encode_value(content)),
            animation_settings: Some(encode_value(&AnimationSettings::default())),
            ..Self::default()
        }
    }

    /// Build an element, filling every missing sub-structure with its default.
    ///
    /// `parent` is used when the record itself does not name its frame,
    /// as is the case for elements nested inside a frame record.
    pub fn hydrate(&self, parent: Option<FrameId>) -> Result<Element, RecordError> {
        let id = self.id.ok_or(RecordError::MissingField("id"))?;
        let frame_id = self
            .frame
            .or(parent)
            .ok_or(RecordError::MissingField("frame"))?;
        let kind = self
            .element_type
            .ok_or(RecordError::MissingField("element_type"))?;

        let position: Position =
            resolve("position", self.position.as_ref(), self.position_parsed.as_ref());
        let content = self.hydrate_content(kind);
        let animation = resolve(
            "animation settings",
            self.animation_settings.as_ref(),
            self.animation_settings_parsed.as_ref(),
        );

        Ok(Element {
            id,
            frame_id,
            kind,
            position: position.clamped(),
            content,
            animation,
            link_url: self.link_url.clone().unwrap_or_default(),
        })
    }

    fn hydrate_content(&self, kind: ElementKind) -> ElementContent {
        let candidates = [self.content.as_ref(), self.content_parsed.as_ref()];
        for blob in candidates.into_iter().flatten().filter(|b| !b.is_null()) {
            match ElementContent::decode(kind, blob) {
                Ok(content) => return content,
                Err(e) => log::warn!("Ignoring {kind} content of element {:?}: {e}", self.id),
            }
        }
        ElementContent::default_for(kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presentation: Option<PresentationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_parsed: Option<FramePosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_image: Option<String>,
    #[serde(default, alias = "order_index", skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_settings: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_settings_parsed: Option<TransitionSettings>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub elements: Vec<ElementRecord>,
}

impl FrameRecord {
    /// Record of a frame without its elements.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            id: Some(frame.id),
            title: Some(frame.title.clone()),
            position: Some(encode_value(&frame.position)),
            background_color: Some(frame.background_color.clone()),
            background_image: Some(frame.background_image.clone()),
            order: Some(frame.order),
            transition_settings: Some(encode_value(&frame.transition)),
            ..Self::default()
        }
    }

    /// Body for `POST /frames/`.
    pub fn draft(presentation: PresentationId, title: impl Into<String>, order: i64) -> Self {
        Self {
            presentation: Some(presentation),
            title: Some(title.into()),
            position: Some(encode_value(&FramePosition::default())),
            order: Some(order),
            transition_settings: Some(encode_value(&TransitionSettings::default())),
            ..Self::default()
        }
    }

    /// Build a frame and its elements. Elements that cannot be hydrated
    /// are logged and skipped; the frame itself still loads.
    pub fn hydrate(&self) -> Result<Frame, RecordError> {
        let id = self.id.ok_or(RecordError::MissingField("id"))?;
        let mut frame = Frame::new(id, self.title.clone().unwrap_or_default(), self.order.unwrap_or(0));

        let position: FramePosition = resolve(
            "frame position",
            self.position.as_ref(),
            self.position_parsed.as_ref(),
        );
        frame.position = position.clamped();
        frame.transition = resolve(
            "transition settings",
            self.transition_settings.as_ref(),
            self.transition_settings_parsed.as_ref(),
        );
        if let Some(color) = &self.background_color {
            frame.background_color = color.clone();
        }
        frame.background_image = self.background_image.clone().unwrap_or_default();

        for record in &self.elements {
            match record.hydrate(Some(id)) {
                // Nested elements always belong to this frame.
                Ok(element) => frame.elements.push(Element { frame_id: id, ..element }),
                Err(e) => log::warn!("Skipping element {:?} in frame {id}: {e}", record.id),
            }
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentationRecord {
    #[serde(default)]
    pub id: Option<PresentationId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub canvas_settings: Option<Value>,
    #[serde(default)]
    pub canvas_settings_parsed: Option<CanvasSettings>,
    #[serde(default)]
    pub current_user_permission: Option<String>,
    #[serde(default)]
    pub frames: Vec<FrameRecord>,
}

impl PresentationRecord {
    pub fn hydrate(&self) -> Result<Presentation, RecordError> {
        let id = self.id.ok_or(RecordError::MissingField("id"))?;
        let info = PresentationInfo {
            id,
            title: self.title.clone().unwrap_or_default(),
            description: self.description.clone().unwrap_or_default(),
            canvas: resolve(
                "canvas settings",
                self.canvas_settings.as_ref(),
                self.canvas_settings_parsed.as_ref(),
            ),
            permission: self
                .current_user_permission
                .as_deref()
                .map(Permission::from_label)
                .unwrap_or_default(),
        };

        let mut frames = Vec::with_capacity(self.frames.len());
        for record in &self.frames {
            match record.hydrate() {
                Ok(frame) => frames.push(frame),
                Err(e) => log::warn!("Skipping frame {:?} of presentation {id}: {e}", record.id),
            }
        }
        frames.sort_by_key(|f| f.order);

        Ok(Presentation { info, frames })
    }
}
