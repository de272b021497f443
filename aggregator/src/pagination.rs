//! Page filters and the paged response envelope shared by every list endpoint.

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PaginationError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid page link {0}")]
    InvalidLink(String),
}

/// Requested page, with the page size capped at `max_page_size` on every read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PaginationFilter {
    page_number: u32,
    page_size: u32,
    pub max_page_size: u32,
}

impl PaginationFilter {
    pub fn new(page_number: u32, page_size: u32, max_page_size: u32) -> Self {
        PaginationFilter {
            page_number,
            page_size,
            max_page_size,
        }
    }

    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn page_size(&self) -> u32 {
        if self.page_size > self.max_page_size {
            self.max_page_size
        } else {
            self.page_size
        }
    }

    /// Row offset of the first record on this page.
    pub fn offset(&self) -> u64 {
        u64::from(self.page_number.saturating_sub(1)) * u64::from(self.page_size())
    }

    fn at_page(&self, page_number: u32) -> Self {
        PaginationFilter {
            page_number,
            ..*self
        }
    }
}

/// Query string accepted by list endpoints.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
}

impl PageQuery {
    pub fn into_filter(self, max_page_size: u32) -> Result<PaginationFilter, PaginationError> {
        let page_number = self
            .page_number
            .ok_or(PaginationError::InvalidArgument("pageNumber is required"))?;
        let page_size = self
            .page_size
            .ok_or(PaginationError::InvalidArgument("pageSize is required"))?;
        if page_number < 1 {
            return Err(PaginationError::InvalidArgument("pageNumber must be >= 1"));
        }
        if page_size < 1 {
            return Err(PaginationError::InvalidArgument("pageSize must be >= 1"));
        }
        Ok(PaginationFilter::new(page_number, page_size, max_page_size))
    }
}

/// Builds absolute page links from the public base URL of the service.
#[derive(Clone, Debug)]
pub struct LinkBuilder {
    base_url: String,
}

impl LinkBuilder {
    pub fn new(base_url: &Url) -> Self {
        LinkBuilder {
            base_url: base_url.as_str().trim_end_matches('/').to_string(),
        }
    }

    pub fn page_link(
        &self,
        endpoint_path: &str,
        filter: &PaginationFilter,
    ) -> Result<String, PaginationError> {
        let raw = format!("{}{}", self.base_url, endpoint_path);
        let mut url = Url::parse(&raw).map_err(|_| PaginationError::InvalidLink(raw))?;
        url.query_pairs_mut()
            .append_pair("pageNumber", &filter.page_number().to_string())
            .append_pair("pageSize", &filter.page_size().to_string());
        Ok(url.into())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    pub data: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_records: u64,
    pub total_pages: u32,
    pub first_page: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_page: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page: Option<String>,
    pub last_page: String,
}

impl<T> PagedResponse<T> {
    pub fn build(
        data: Vec<T>,
        total_records: u64,
        filter: &PaginationFilter,
        links: &LinkBuilder,
        endpoint_path: &str,
    ) -> Result<Self, PaginationError> {
        if endpoint_path.is_empty() {
            return Err(PaginationError::InvalidArgument("endpoint path is empty"));
        }
        let page_size = filter.page_size();
        if page_size == 0 {
            return Err(PaginationError::InvalidArgument("page size must be positive"));
        }

        let total_pages = (total_records as f64 / f64::from(page_size)).ceil() as u32;
        let page_number = filter.page_number();

        let next_page = if page_number >= 1 && page_number < total_pages {
            Some(links.page_link(endpoint_path, &filter.at_page(page_number + 1))?)
        } else {
            None
        };

        let previous_page = if page_number >= 2 && page_number <= total_pages {
            Some(links.page_link(endpoint_path, &filter.at_page(page_number - 1))?)
        } else {
            None
        };

        // With no records the last page is page 0.
        let first_page = links.page_link(endpoint_path, &filter.at_page(1))?;
        let last_page = links.page_link(endpoint_path, &filter.at_page(total_pages))?;

        Ok(PagedResponse {
            data,
            page_number,
            page_size,
            total_records,
            total_pages,
            first_page,
            previous_page,
            next_page,
            last_page,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATH: &str = "/api/v1/cmdb-applications";

    fn links() -> LinkBuilder {
        LinkBuilder::new(&Url::parse("https://connections.example.com/").unwrap())
    }

    fn page(page_number: u32, total: u64) -> PagedResponse<u32> {
        let filter = PaginationFilter::new(page_number, 10, 50);
        PagedResponse::build(vec![], total, &filter, &links(), PATH).unwrap()
    }

    #[test]
    fn first_middle_and_last_page_links() {
        let first = page(1, 25);
        assert_eq!(first.total_pages, 3);
        assert_eq!(first.previous_page, None);
        assert_eq!(
            first.next_page.as_deref(),
            Some("https://connections.example.com/api/v1/cmdb-applications?pageNumber=2&pageSize=10")
        );

        let middle = page(2, 25);
        assert!(middle.previous_page.as_deref().unwrap().contains("pageNumber=1"));
        assert!(middle.next_page.as_deref().unwrap().contains("pageNumber=3"));

        let last = page(3, 25);
        assert_eq!(last.next_page, None);
        assert!(last.previous_page.as_deref().unwrap().contains("pageNumber=2"));
        assert!(last.first_page.contains("pageNumber=1"));
        assert!(last.last_page.contains("pageNumber=3"));
    }

    #[test]
    fn page_size_is_clamped_on_every_read() {
        let mut filter = PaginationFilter::new(1, 1000, 50);
        assert_eq!(filter.page_size(), 50);

        let response = PagedResponse::build(vec![1], 120, &filter, &links(), PATH).unwrap();
        assert_eq!(response.page_size, 50);
        assert_eq!(response.total_pages, 3);
        assert!(response.next_page.unwrap().ends_with("pageSize=50"));

        filter.max_page_size = 20;
        assert_eq!(filter.page_size(), 20);
        assert_eq!(PaginationFilter::new(3, 10, 50).offset(), 20);
    }

    #[test]
    fn empty_collection_links_to_page_zero() {
        let response = page(1, 0);
        assert_eq!(response.total_pages, 0);
        assert_eq!(response.next_page, None);
        assert_eq!(response.previous_page, None);
        assert!(response.first_page.contains("pageNumber=1"));
        assert_eq!(
            response.last_page,
            "https://connections.example.com/api/v1/cmdb-applications?pageNumber=0&pageSize=10"
        );
    }

    #[test]
    fn page_past_the_end_has_no_neighbours() {
        let response = page(7, 25);
        assert_eq!(response.next_page, None);
        assert_eq!(response.previous_page, None);
    }

    #[test]
    fn invalid_arguments() {
        let filter = PaginationFilter::new(1, 10, 50);
        assert_eq!(
            PagedResponse::<u32>::build(vec![], 5, &filter, &links(), "").unwrap_err(),
            PaginationError::InvalidArgument("endpoint path is empty")
        );

        let zero = PaginationFilter::new(1, 0, 50);
        assert!(PagedResponse::<u32>::build(vec![], 5, &zero, &links(), PATH).is_err());
    }

    #[test]
    fn query_validation() {
        let ok = PageQuery {
            page_number: Some(2),
            page_size: Some(500),
        }
        .into_filter(100)
        .unwrap();
        assert_eq!(ok.page_number(), 2);
        assert_eq!(ok.page_size(), 100);

        let missing = PageQuery {
            page_number: None,
            page_size: Some(10),
        };
        assert!(missing.into_filter(100).is_err());

        let zero = PageQuery {
            page_number: Some(0),
            page_size: Some(10),
        };
        assert_eq!(
            zero.into_filter(100).unwrap_err(),
            PaginationError::InvalidArgument("pageNumber must be >= 1")
        );
    }
}
