use crate::codec::{self, WireType, NULL_TYPE};
use crate::error::StoreError;
use crate::state::{State, Value};
use crate::tree::Element;
use crate::Result;

/// Read a tree document back into a record.
pub fn deserialize(xml: &str) -> Result<State> {
    let root = Element::parse(xml).map_err(StoreError::Deserialization)?;
    element_to_state(&root)
}

/// Convert every child of `el` into a field of a new state.
pub fn element_to_state(el: &Element) -> Result<State> {
    let mut state = State::new();
    for child in &el.children {
        let value = element_to_value(child)?;
        state.insert(codec::deserialize_key(&child.name), value);
    }
    Ok(state)
}

/// Convert one field element into a value.
pub fn element_to_value(el: &Element) -> Result<Value> {
    if el.is_leaf() {
        return match el.type_attr() {
            None if el.text.is_empty() => Ok(Value::Array(Vec::new())),
            Some(NULL_TYPE) => Ok(Value::Null),
            type_name => parse_scalar(type_name, &el.text, &el.name),
        };
    }

    let first = &el.children[0];
    if !first.is_array_item() {
        return element_to_state(el).map(Value::State);
    }

    if first.is_leaf() && first.type_attr().is_some() {
        let items = el
            .children
            .iter()
            .map(|item| {
                if !item.is_leaf() {
                    return Err(StoreError::Deserialization(format!(
                        "mixed array in <{}>",
                        el.name
                    )));
                }
                match item.type_attr() {
                    Some(NULL_TYPE) => Ok(Value::Null),
                    type_name => parse_scalar(type_name, &item.text, &el.name),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Array(items))
    } else {
        let states = el
            .children
            .iter()
            .map(element_to_state)
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::List(states))
    }
}

fn parse_scalar(type_name: Option<&str>, text: &str, field: &str) -> Result<Value> {
    let wire_type = type_name
        .and_then(WireType::from_name)
        .unwrap_or(WireType::String);
    wire_type
        .parse(text)
        .map_err(|e| StoreError::Deserialization(format!("<{field}>: {e}")))
}
