//! Resource Graph query templates. `{name}` placeholders are bound by
//! `GraphQueryRequest::render` as escaped string literals.

/// Columns every resource listing projects.
pub const RESOURCE_COLUMNS: &str =
    "id, name, type, location, resourceGroup, subscriptionId, tags, properties, kind, sku, zones";

/// Every resource in scope.
pub fn full_listing() -> String {
    format!("resources | project {}", RESOURCE_COLUMNS)
}

/// Every resource of one type. Binds `resource_type`.
pub fn full_listing_by_type() -> String {
    format!(
        "resources | where type =~ {{resource_type}} | project {}",
        RESOURCE_COLUMNS
    )
}

/// Resources changed after a timestamp, with their current state. Binds `since`.
pub fn changed_since() -> String {
    format!(
        "resourcechanges \
         | extend changeTime = todatetime(properties.changeAttributes.timestamp), \
                  targetResourceId = tolower(tostring(properties.targetResourceId)) \
         | where changeTime > todatetime({{since}}) \
         | summarize changeTime = max(changeTime) by targetResourceId \
         | join kind=inner (resources | extend targetResourceId = tolower(id)) on targetResourceId \
         | project {}, changeTime",
        RESOURCE_COLUMNS
    )
}

/// Ids of every resource in scope.
pub const ID_LISTING: &str = "resources | project id";

/// One resource by id. Binds `resource_id`.
pub const RESOURCE_BY_ID: &str =
    "resources | where id =~ {resource_id} | project id, name, type, resourceGroup, subscriptionId, properties";

/// Resources whose properties mention an id. Binds `resource_id`.
pub const REFERENCING_RESOURCES: &str =
    "resources | where id !~ {resource_id} and tostring(properties) contains {resource_id} | project id, name, type";

#[cfg(test)]
mod tests {
    use super::*;
    use iw_connectors::GraphQueryRequest;

    #[test]
    fn test_templates_render_with_their_parameters() {
        let by_type = GraphQueryRequest::new(vec![], full_listing_by_type())
            .with_parameter("resource_type", "microsoft.web/sites");
        assert!(by_type.render().unwrap().contains("type =~ 'microsoft.web/sites'"));

        let changed = GraphQueryRequest::new(vec![], changed_since())
            .with_parameter("since", "2024-01-01T00:00:00Z");
        assert!(changed
            .render()
            .unwrap()
            .contains("todatetime('2024-01-01T00:00:00Z')"));

        let refs = GraphQueryRequest::new(vec![], REFERENCING_RESOURCES)
            .with_parameter("resource_id", "/subscriptions/s/x");
        assert_eq!(refs.render().unwrap().matches("'/subscriptions/s/x'").count(), 2);
    }

    #[test]
    fn test_listing_templates_need_no_parameters() {
        assert!(GraphQueryRequest::new(vec![], full_listing()).render().is_ok());
        assert!(GraphQueryRequest::new(vec![], ID_LISTING).render().is_ok());
        assert!(GraphQueryRequest::new(vec![], full_listing_by_type()).render().is_err());
    }
}
