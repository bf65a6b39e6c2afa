//! The shared shape model and partial updates over it.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Owner, OwnerId, ShapeId, Timestamp};

/// Geometric primitive drawn by the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
    Text,
}

/// A shape as stored durably and mirrored by every client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub fill: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub z_index: i64,
    #[serde(default = "default_visible")]
    pub visible: bool,

    // --- Lock state ---
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub locked_by: Option<OwnerId>,
    #[serde(default)]
    pub locked_by_name: Option<String>,
    #[serde(default)]
    pub locked_by_color: Option<String>,

    // --- Audit ---
    pub created_by: OwnerId,
    pub created_at: Timestamp,
    pub last_modified_by: OwnerId,
    pub last_modified_at: Timestamp,
}

fn default_visible() -> bool {
    true
}

impl Shape {
    /// Build an unlocked shape from a creation spec.
    pub fn from_spec(id: ShapeId, spec: &ShapeSpec, creator: &OwnerId) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind: spec.kind,
            x: spec.x,
            y: spec.y,
            width: spec.width,
            height: spec.height,
            fill: spec.fill.clone(),
            text: spec.text.clone(),
            rotation: spec.rotation,
            z_index: spec.z_index,
            visible: true,
            is_locked: false,
            locked_by: None,
            locked_by_name: None,
            locked_by_color: None,
            created_by: creator.clone(),
            created_at: now,
            last_modified_by: creator.clone(),
            last_modified_at: now,
        }
    }

    /// Returns `true` if `owner` currently holds this shape's lock.
    pub fn is_locked_by(&self, owner: &OwnerId) -> bool {
        self.is_locked && self.locked_by.as_ref() == Some(owner)
    }

    /// The holder of the lock, if the lock is held by somebody other than
    /// `owner`.
    pub fn held_by_other(&self, owner: &OwnerId) -> Option<&OwnerId> {
        match &self.locked_by {
            Some(holder) if self.is_locked && holder != owner => Some(holder),
            _ => None,
        }
    }

    /// Stamp the audit fields for a modification made by `actor`.
    pub fn touch(&mut self, actor: &OwnerId) {
        self.last_modified_by = actor.clone();
        self.last_modified_at = Utc::now();
    }

    /// Structural equality over geometry, style and creator.
    ///
    /// Ignores id, lock state and modification audit, so a locally created
    /// shape can be matched against its durably committed counterpart.
    pub fn same_content(&self, other: &Shape) -> bool {
        self.kind == other.kind
            && self.x == other.x
            && self.y == other.y
            && self.width == other.width
            && self.height == other.height
            && self.fill == other.fill
            && self.text == other.text
            && self.rotation == other.rotation
            && self.z_index == other.z_index
            && self.visible == other.visible
            && self.created_by == other.created_by
    }
}

// ---------------------------------------------------------------------------
// ShapeSpec
// ---------------------------------------------------------------------------

/// Input for creating a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeSpec {
    pub kind: ShapeKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub fill: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub z_index: i64,
}

impl ShapeSpec {
    pub fn new(kind: ShapeKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            kind,
            x,
            y,
            width,
            height,
            fill: "#cccccc".to_string(),
            text: None,
            rotation: 0.0,
            z_index: 0,
        }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = fill.into();
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        for (name, value) in [
            ("x", self.x),
            ("y", self.y),
            ("width", self.width),
            ("height", self.height),
            ("rotation", self.rotation),
        ] {
            if !value.is_finite() {
                return Err(CoreError::Validation(format!("{name} must be finite")));
            }
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(CoreError::Validation(format!(
                "size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.fill.trim().is_empty() {
            return Err(CoreError::Validation("fill must not be empty".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ShapePatch
// ---------------------------------------------------------------------------

/// A partial update over every mutable shape field.
///
/// `None` leaves a field untouched. Nullable fields use a nested `Option`
/// so that "set to null" can be distinguished from "leave alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapePatch {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub width: Option<f64>,
    pub height: Option<f64>,
    pub fill: Option<String>,
    pub text: Option<Option<String>>,
    pub rotation: Option<f64>,
    pub z_index: Option<i64>,
    pub visible: Option<bool>,
    pub is_locked: Option<bool>,
    pub locked_by: Option<Option<OwnerId>>,
    pub locked_by_name: Option<Option<String>>,
    pub locked_by_color: Option<Option<String>>,
}

impl ShapePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    pub fn size(width: f64, height: f64) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn fill(fill: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.into()),
            ..Default::default()
        }
    }

    /// Lock fields granting ownership to `owner`.
    pub fn lock(owner: &Owner) -> Self {
        Self {
            is_locked: Some(true),
            locked_by: Some(Some(owner.id.clone())),
            locked_by_name: Some(Some(owner.name.clone())),
            locked_by_color: Some(Some(owner.color.clone())),
            ..Default::default()
        }
    }

    /// Lock fields clearing ownership.
    pub fn unlock() -> Self {
        Self {
            is_locked: Some(false),
            locked_by: Some(None),
            locked_by_name: Some(None),
            locked_by_color: Some(None),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn touches_lock(&self) -> bool {
        self.is_locked.is_some()
            || self.locked_by.is_some()
            || self.locked_by_name.is_some()
            || self.locked_by_color.is_some()
    }

    /// The same patch with every lock field dropped.
    pub fn without_lock_fields(&self) -> Self {
        Self {
            is_locked: None,
            locked_by: None,
            locked_by_name: None,
            locked_by_color: None,
            ..self.clone()
        }
    }

    /// Write every set field into `shape`. Audit fields are not touched.
    pub fn apply_to(&self, shape: &mut Shape) {
        if let Some(v) = self.x {
            shape.x = v;
        }
        if let Some(v) = self.y {
            shape.y = v;
        }
        if let Some(v) = self.width {
            shape.width = v;
        }
        if let Some(v) = self.height {
            shape.height = v;
        }
        if let Some(v) = &self.fill {
            shape.fill = v.clone();
        }
        if let Some(v) = &self.text {
            shape.text = v.clone();
        }
        if let Some(v) = self.rotation {
            shape.rotation = v;
        }
        if let Some(v) = self.z_index {
            shape.z_index = v;
        }
        if let Some(v) = self.visible {
            shape.visible = v;
        }
        if let Some(v) = self.is_locked {
            shape.is_locked = v;
        }
        if let Some(v) = &self.locked_by {
            shape.locked_by = v.clone();
        }
        if let Some(v) = &self.locked_by_name {
            shape.locked_by_name = v.clone();
        }
        if let Some(v) = &self.locked_by_color {
            shape.locked_by_color = v.clone();
        }
    }

    /// The current values in `shape` of exactly the fields this patch sets.
    ///
    /// Applying the captured patch after `self` restores the shape to its
    /// pre-image for those fields.
    pub fn capture_from(&self, shape: &Shape) -> Self {
        Self {
            x: self.x.map(|_| shape.x),
            y: self.y.map(|_| shape.y),
            width: self.width.map(|_| shape.width),
            height: self.height.map(|_| shape.height),
            fill: self.fill.as_ref().map(|_| shape.fill.clone()),
            text: self.text.as_ref().map(|_| shape.text.clone()),
            rotation: self.rotation.map(|_| shape.rotation),
            z_index: self.z_index.map(|_| shape.z_index),
            visible: self.visible.map(|_| shape.visible),
            is_locked: self.is_locked.map(|_| shape.is_locked),
            locked_by: self.locked_by.as_ref().map(|_| shape.locked_by.clone()),
            locked_by_name: self
                .locked_by_name
                .as_ref()
                .map(|_| shape.locked_by_name.clone()),
            locked_by_color: self
                .locked_by_color
                .as_ref()
                .map(|_| shape.locked_by_color.clone()),
        }
    }

    /// Returns `true` if every field set in this patch already has the
    /// patched value in `shape`.
    pub fn matches(&self, shape: &Shape) -> bool {
        let mut probe = shape.clone();
        self.apply_to(&mut probe);
        probe == *shape
    }

    /// Fold a later patch into this one; fields set in `later` win.
    pub fn merge(&mut self, later: &ShapePatch) {
        fn take<T: Clone>(slot: &mut Option<T>, later: &Option<T>) {
            if later.is_some() {
                slot.clone_from(later);
            }
        }
        take(&mut self.x, &later.x);
        take(&mut self.y, &later.y);
        take(&mut self.width, &later.width);
        take(&mut self.height, &later.height);
        take(&mut self.fill, &later.fill);
        take(&mut self.text, &later.text);
        take(&mut self.rotation, &later.rotation);
        take(&mut self.z_index, &later.z_index);
        take(&mut self.visible, &later.visible);
        take(&mut self.is_locked, &later.is_locked);
        take(&mut self.locked_by, &later.locked_by);
        take(&mut self.locked_by_name, &later.locked_by_name);
        take(&mut self.locked_by_color, &later.locked_by_color);
    }
}
