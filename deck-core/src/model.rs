//! Document model: presentations, frames and elements.
//!
//! ```text
//! Presentation
//!   └── Frame (ordered by `order`)
//!         └── Element (TEXT | IMAGE | SHAPE | VIDEO | PDF)
//! ```
//!
//! Positions live in document space. Width and height are never smaller
//! than [`MIN_SIZE`] once a value has passed through the store.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest width/height an element or frame may have, in document units.
pub const MIN_SIZE: f64 = 40.0;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Server-assigned presentation id.
    PresentationId
);
id_type!(
    /// Server-assigned frame id.
    FrameId
);
id_type!(
    /// Server-assigned element id.
    ElementId
);
id_type!(
    /// Participant (user) id as issued by the authentication service.
    ParticipantId
);

/// 2D point. Used for pointer coordinates (viewport space) and
/// canvas offsets (document space).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Element geometry in document space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
    /// Paint order only; not unique.
    pub z_index: i64,
}

impl Default for Position {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 100.0,
            height: 100.0,
            rotation: 0.0,
            z_index: 1,
        }
    }
}

impl Position {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            ..Self::default()
        }
    }

    /// Copy with width/height raised to [`MIN_SIZE`].
    pub fn clamped(self) -> Self {
        Self {
            width: clamp_size(self.width),
            height: clamp_size(self.height),
            ..self
        }
    }

    pub fn translated(self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }
}

/// Frame geometry in document space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramePosition {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rotation: f64,
}

impl Default for FramePosition {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1920.0,
            height: 1080.0,
            rotation: 0.0,
        }
    }
}

impl FramePosition {
    pub fn clamped(self) -> Self {
        Self {
            width: clamp_size(self.width),
            height: clamp_size(self.height),
            ..self
        }
    }
}

pub(crate) fn clamp_size(value: f64) -> f64 {
    // NaN falls through max() as MIN_SIZE.
    value.max(MIN_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementKind {
    Text,
    Image,
    Shape,
    Video,
    Pdf,
}

impl ElementKind {
    pub const ALL: [ElementKind; 5] = [
        ElementKind::Text,
        ElementKind::Image,
        ElementKind::Shape,
        ElementKind::Video,
        ElementKind::Pdf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Text => "TEXT",
            ElementKind::Image => "IMAGE",
            ElementKind::Shape => "SHAPE",
            ElementKind::Video => "VIDEO",
            ElementKind::Pdf => "PDF",
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ───────────────────────────────────────────────────────────────────
// Content payloads, one per element kind
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    #[serde(alias = "font_size")]
    pub font_size: f64,
    #[serde(alias = "font_family")]
    pub font_family: String,
    pub color: String,
    pub align: String,
}

impl Default for TextContent {
    fn default() -> Self {
        Self {
            text: String::new(),
            font_size: 16.0,
            font_family: "Inter".to_string(),
            color: "#000000".to_string(),
            align: "left".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageContent {
    pub url: String,
    pub alt: String,
    /// CSS filter expression, if any.
    pub filters: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShapeContent {
    #[serde(alias = "shape_type")]
    pub shape: String,
    pub fill: String,
    pub stroke: String,
    #[serde(alias = "stroke_width")]
    pub stroke_width: f64,
}

impl Default for ShapeContent {
    fn default() -> Self {
        Self {
            shape: "rectangle".to_string(),
            fill: "transparent".to_string(),
            stroke: "#000000".to_string(),
            stroke_width: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoContent {
    pub url: String,
    pub autoplay: bool,
    #[serde(rename = "loop")]
    pub looping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfContent {
    pub url: String,
    pub page: u32,
}

impl Default for PdfContent {
    fn default() -> Self {
        Self {
            url: String::new(),
            page: 1,
        }
    }
}

/// Type-specific element payload. The variant always matches the
/// owning element's [`ElementKind`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ElementContent {
    Text(TextContent),
    Image(ImageContent),
    Shape(ShapeContent),
    Video(VideoContent),
    Pdf(PdfContent),
}

impl ElementContent {
    /// Default payload for a given kind.
    pub fn default_for(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Text => ElementContent::Text(TextContent::default()),
            ElementKind::Image => ElementContent::Image(ImageContent::default()),
            ElementKind::Shape => ElementContent::Shape(ShapeContent::default()),
            ElementKind::Video => ElementContent::Video(VideoContent::default()),
            ElementKind::Pdf => ElementContent::Pdf(PdfContent::default()),
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            ElementContent::Text(_) => ElementKind::Text,
            ElementContent::Image(_) => ElementKind::Image,
            ElementContent::Shape(_) => ElementKind::Shape,
            ElementContent::Video(_) => ElementKind::Video,
            ElementContent::Pdf(_) => ElementKind::Pdf,
        }
    }

    /// Media URL for kinds that reference the asset store.
    pub fn url(&self) -> Option<&str> {
        match self {
            ElementContent::Image(c) => Some(&c.url),
            ElementContent::Video(c) => Some(&c.url),
            ElementContent::Pdf(c) => Some(&c.url),
            ElementContent::Text(_) | ElementContent::Shape(_) => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Animation / transition settings
// ───────────────────────────────────────────────────────────────────

/// Entrance animation for an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimationSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub direction: String,
    pub duration: f64,
    pub delay: f64,
    pub easing: String,
}

impl Default for AnimationSettings {
    fn default() -> Self {
        Self {
            kind: "fade".to_string(),
            direction: "up".to_string(),
            duration: 0.8,
            delay: 0.0,
            easing: "easeInOut".to_string(),
        }
    }
}

/// Slide transition played when a frame is entered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionSettings {
    #[serde(rename = "type")]
    pub kind: String,
    pub direction: String,
    pub duration: f64,
    pub delay: f64,
}

impl Default for TransitionSettings {
    fn default() -> Self {
        Self {
            kind: "fade".to_string(),
            direction: "none".to_string(),
            duration: 0.8,
            delay: 0.0,
        }
    }
}

/// Canvas-wide settings of a presentation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanvasSettings {
    pub zoom: f64,
    pub viewport: Point,
    pub background: String,
}

impl Default for CanvasSettings {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            viewport: Point::ZERO,
            background: "#FFFFFF".to_string(),
        }
    }
}

/// Access level of the local participant on the open presentation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    Owner,
    Editor,
    #[default]
    Viewer,
}

impl Permission {
    /// Parse the server's permission label. Anything unrecognised is
    /// treated as read-only.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_uppercase().as_str() {
            "OWNER" => Permission::Owner,
            "EDITOR" => Permission::Editor,
            _ => Permission::Viewer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Owner => "OWNER",
            Permission::Editor => "EDITOR",
            Permission::Viewer => "VIEWER",
        }
    }

    pub fn can_edit(&self) -> bool {
        matches!(self, Permission::Owner | Permission::Editor)
    }
}

// ───────────────────────────────────────────────────────────────────
// Document nodes
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub id: ElementId,
    /// Owning frame. Always names a frame present in the store.
    pub frame_id: FrameId,
    pub kind: ElementKind,
    pub position: Position,
    pub content: ElementContent,
    pub animation: AnimationSettings,
    pub link_url: String,
}

impl Element {
    /// New element with default content for `kind`.
    pub fn new(id: ElementId, frame_id: FrameId, kind: ElementKind, position: Position) -> Self {
        Self {
            id,
            frame_id,
            kind,
            position: position.clamped(),
            content: ElementContent::default_for(kind),
            animation: AnimationSettings::default(),
            link_url: String::new(),
        }
    }

    pub fn with_content(mut self, content: ElementContent) -> Self {
        self.kind = content.kind();
        self.content = content;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: FrameId,
    pub title: String,
    pub position: FramePosition,
    pub background_color: String,
    /// Empty when the frame has no background image.
    pub background_image: String,
    /// Display order; unique within a presentation by convention only.
    pub order: i64,
    pub transition: TransitionSettings,
    pub elements: Vec<Element>,
}

impl Frame {
    pub fn new(id: FrameId, title: impl Into<String>, order: i64) -> Self {
        Self {
            id,
            title: title.into(),
            position: FramePosition::default(),
            background_color: "#FFFFFF".to_string(),
            background_image: String::new(),
            order,
            transition: TransitionSettings::default(),
            elements: Vec::new(),
        }
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        self.elements.iter().find(|e| e.id == id)
    }

    /// Elements sorted by paint order (stable for equal z_index).
    pub fn paint_order(&self) -> Vec<&Element> {
        let mut sorted: Vec<&Element> = self.elements.iter().collect();
        sorted.sort_by_key(|e| e.position.z_index);
        sorted
    }
}

/// Presentation metadata, without its frames.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationInfo {
    pub id: PresentationId,
    pub title: String,
    pub description: String,
    pub canvas: CanvasSettings,
    pub permission: Permission,
}

/// A full nested snapshot, as loaded at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct Presentation {
    pub info: PresentationInfo,
    pub frames: Vec<Frame>,
}
