use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentItem {
    pub item_name: String,
}

impl PaymentItem {
    pub fn new(item_name: impl Into<String>) -> Self {
        Self {
            item_name: item_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub id: String,
    pub customer: String,
    pub amount: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_instance_id: Option<String>,
    #[serde(default)]
    pub payment_items: Vec<PaymentItem>,
    /// Errors of child payments that failed; their items are left unchanged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_failures: Vec<String>,
}

impl PaymentRequest {
    pub fn new(id: impl Into<String>, customer: impl Into<String>, amount: i32) -> Self {
        Self {
            id: id.into(),
            customer: customer.into(),
            amount,
            ..Self::default()
        }
    }

    pub fn with_items<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payment_items = names.into_iter().map(PaymentItem::new).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_is_camel_case() {
        let req = PaymentRequest::new("p-1", "salaboy", 10).with_items(["a"]);
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"id":"p-1","customer":"salaboy","amount":10,"paymentItems":[{"itemName":"a"}]}"#
        );
        let back: PaymentRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
