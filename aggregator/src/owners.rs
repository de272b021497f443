//! Owner extraction from CMDB application descriptions.
//!
//! Descriptions follow a `text | business owner | technical owner` convention
//! that the CMDB does not enforce, so any segment may be missing or hold
//! something else entirely. Nothing is validated beyond position.

const DELIMITER: char = '|';
const BUSINESS_OWNER_SEGMENT: usize = 1;
const TECHNICAL_OWNER_SEGMENT: usize = 2;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Owners {
    pub business_owner: Option<String>,
    pub technical_owner: Option<String>,
}

pub fn parse_owners(description: Option<&str>) -> Owners {
    let Some(description) = description else {
        return Owners::default();
    };

    let segments: Vec<&str> = description.split(DELIMITER).map(str::trim).collect();
    let segment = |index: usize| {
        segments
            .get(index)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    };

    Owners {
        business_owner: segment(BUSINESS_OWNER_SEGMENT),
        technical_owner: segment(TECHNICAL_OWNER_SEGMENT),
    }
}
