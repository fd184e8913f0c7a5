use crate::codec::{self, WireType, ARRAY_ITEM, NULL_TYPE, TYPE_ATTR};
use crate::state::{State, Value};
use crate::tree::{Element, ROOT};

/// Serialize a record to its tree document text.
pub fn serialize(state: &State) -> String {
    state_to_element(ROOT, state).to_xml()
}

/// Build the element for a state under the given element name.
pub fn state_to_element(name: &str, state: &State) -> Element {
    let mut el = Element::new(name);
    for (key, value) in state.iter() {
        if let Some(child) = value_to_element(&codec::serialize_key(key), value) {
            el.children.push(child);
        }
    }
    el
}

/// Build the element for a single field.
///
/// Returns `None` for values that are not stored: nulls and nested states
/// holding nothing stored, however deep.
pub fn value_to_element(name: &str, value: &Value) -> Option<Element> {
    match value {
        Value::Null => None,
        Value::State(state) => {
            let el = state_to_element(name, state);
            (!el.children.is_empty()).then_some(el)
        }
        Value::Array(items) => {
            let mut el = Element::new(name);
            el.children = items.iter().map(item_to_element).collect();
            Some(el)
        }
        Value::List(states) => {
            let mut el = Element::new(name);
            el.children = states
                .iter()
                .map(|s| state_to_element(ARRAY_ITEM, s))
                .collect();
            Some(el)
        }
        scalar => Some(scalar_to_element(name, scalar)),
    }
}

/// Build one `__array_item` element for a list member.
pub fn item_to_element(item: &Value) -> Element {
    match item {
        Value::Null => {
            let mut el = Element::new(ARRAY_ITEM);
            el.set_attr(TYPE_ATTR, NULL_TYPE);
            el
        }
        Value::State(state) => state_to_element(ARRAY_ITEM, state),
        other => value_to_element(ARRAY_ITEM, other).unwrap_or_else(|| Element::new(ARRAY_ITEM)),
    }
}

fn scalar_to_element(name: &str, value: &Value) -> Element {
    let wire_type = WireType::classify(value);
    let text = value.to_wire_text().unwrap_or_default();
    Element::leaf(name, wire_type.name(), text)
}
