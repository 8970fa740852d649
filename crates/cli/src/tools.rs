//! Order-lookup tools for the bundled customer-support assistant.

use {
    async_trait::async_trait,
    chrono::{Days, Local, NaiveDate},
    serde::Deserialize,
    serde_json::{Value, json},
    toolstream_agents::{ToolRegistry, TypedTool},
    tracing::info,
};

pub fn demo_registry() -> toolstream_agents::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register_typed(FindOrderByName)?;
    registry.register_typed(GetDeliveryDate)?;
    Ok(registry)
}

pub struct FindOrderByName;

#[derive(Debug, Deserialize)]
pub struct FindOrderParams {
    customer_name: String,
}

#[async_trait]
impl TypedTool for FindOrderByName {
    type Output = Value;
    type Params = FindOrderParams;

    fn name(&self) -> &str {
        "find_order_by_name"
    }

    fn description(&self) -> &str {
        "Finds the customer's order ID based on their full name."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "customer_name": {
                    "type": "string",
                    "description": "The full name of the customer."
                }
            },
            "required": ["customer_name"]
        })
    }

    async fn call(&self, params: FindOrderParams) -> anyhow::Result<Value> {
        let result = find_order(&params.customer_name);
        info!(customer = %params.customer_name, result = %result, "find_order_by_name");
        Ok(result)
    }
}

/// Simulated lookup: any full name (first and last) has an order.
fn find_order(customer_name: &str) -> Value {
    let name = customer_name.trim();
    match name.split_whitespace().next() {
        Some(first) if name.contains(' ') && name.chars().count() > 3 => {
            let prefix: String = first.chars().take(3).collect::<String>().to_uppercase();
            json!({ "order_id": format!("ORD-{prefix}{:02}", name.chars().count()) })
        },
        _ => json!({
            "order_id": null,
            "message": format!("Could not find order for '{customer_name}'. Verify name."),
        }),
    }
}

pub struct GetDeliveryDate;

#[derive(Debug, Deserialize)]
pub struct DeliveryDateParams {
    order_id: String,
}

#[async_trait]
impl TypedTool for GetDeliveryDate {
    type Output = Value;
    type Params = DeliveryDateParams;

    fn name(&self) -> &str {
        "get_delivery_date"
    }

    fn description(&self) -> &str {
        "Get the estimated delivery date for a specific order ID. Only call this after you have \
         obtained the order ID."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "order_id": {
                    "type": "string",
                    "description": "The customer's unique order identifier."
                }
            },
            "required": ["order_id"]
        })
    }

    async fn call(&self, params: DeliveryDateParams) -> anyhow::Result<Value> {
        let result = delivery_date(&params.order_id, Local::now().date_naive());
        info!(order_id = %params.order_id, result = %result, "get_delivery_date");
        Ok(result)
    }
}

/// Every valid order ships in three days.
fn delivery_date(order_id: &str, today: NaiveDate) -> Value {
    if !order_id.trim().starts_with("ORD-") {
        return json!({ "error": format!("Invalid order_id format: '{order_id}'.") });
    }
    let estimate = today.checked_add_days(Days::new(3)).unwrap_or(today);
    json!({
        "order_id": order_id,
        "estimated_delivery_date": estimate.format("%Y-%m-%d").to_string(),
    })
}
