//! Typed tree document format
//!
//! A [`State`] is stored as one `document` element. Each field becomes a child
//! element named by its escaped key; scalars carry a `type` attribute, nested
//! states recurse without a wrapper, and lists are elements whose children are
//! all `__array_item`.
//!
//! ```text
//! <document>
//!   <ecm__id type="string">doc1</ecm__id>
//!   <tags><__array_item type="string">a</__array_item></tags>
//!   <empty/>                       <!-- zero-length array -->
//! </document>
//! ```

mod de;
mod element;
mod ser;

pub use de::{deserialize, element_to_state, element_to_value};
pub use element::Element;
pub use ser::{item_to_element, serialize, state_to_element, value_to_element};

/// Root element name of every stored record.
pub const ROOT: &str = "document";
