use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const ALLOWED_SLIDE_COUNTS: [u32; 3] = [2, 4, 6];

/// Label always reserved for the persona avatar.
pub const AVATAR_REFERENCE_LABEL: &str = "[1]";

/// Grid arrangement written as `RxC` (rows x columns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GridLayout {
    #[serde(rename = "1x2")]
    OneByTwo,
    #[serde(rename = "2x1")]
    TwoByOne,
    #[serde(rename = "2x2")]
    TwoByTwo,
    #[serde(rename = "2x3")]
    TwoByThree,
    #[serde(rename = "3x2")]
    ThreeByTwo,
}

impl GridLayout {
    pub const ALL: [GridLayout; 5] = [
        GridLayout::OneByTwo,
        GridLayout::TwoByOne,
        GridLayout::TwoByTwo,
        GridLayout::TwoByThree,
        GridLayout::ThreeByTwo,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('×', "x");
        Self::ALL
            .into_iter()
            .find(|layout| layout.as_str() == normalized)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneByTwo => "1x2",
            Self::TwoByOne => "2x1",
            Self::TwoByTwo => "2x2",
            Self::TwoByThree => "2x3",
            Self::ThreeByTwo => "3x2",
        }
    }

    pub fn rows(&self) -> u32 {
        match self {
            Self::OneByTwo => 1,
            Self::TwoByOne | Self::TwoByTwo | Self::TwoByThree => 2,
            Self::ThreeByTwo => 3,
        }
    }

    pub fn cols(&self) -> u32 {
        match self {
            Self::TwoByOne => 1,
            Self::OneByTwo | Self::TwoByTwo | Self::ThreeByTwo => 2,
            Self::TwoByThree => 3,
        }
    }

    pub fn slide_count(&self) -> u32 {
        self.rows() * self.cols()
    }

    /// First layout whose panel count equals `count`.
    pub fn default_for(count: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|layout| layout.slide_count() == count)
    }
}

impl fmt::Display for GridLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GridLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unsupported grid layout: {s}"))
    }
}

pub fn layout_matches_count(count: u32, layout: GridLayout) -> bool {
    ALLOWED_SLIDE_COUNTS.contains(&count) && layout.slide_count() == count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    Reference,
    PromptOnly,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageRole {
    Character,
    Product,
    Person,
    Location,
    #[default]
    Object,
}

impl ImageRole {
    /// Lenient parse used on model output; unknown roles become `Object`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "character" => Self::Character,
            "product" => Self::Product,
            "person" => Self::Person,
            "location" | "place" | "scene" => Self::Location,
            _ => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Product => "product",
            Self::Person => "person",
            Self::Location => "location",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDecision {
    #[serde(default)]
    pub image_id: String,
    pub selected_image_url: String,
    pub usage_type: UsageType,
    #[serde(default)]
    pub role: ImageRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_label: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidePanel {
    pub panel_number: u32,
    pub panel_description: String,
    #[serde(default)]
    pub uses_images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlidePlan {
    pub slide_count: u32,
    pub grid_layout: GridLayout,
    pub caption: String,
    pub slides: Vec<SlidePanel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedPost {
    pub slide_count: u32,
    pub grid_layout: GridLayout,
    pub slide_urls: Vec<String>,
    pub grid_url: String,
    pub caption: String,
    #[serde(default)]
    pub image_usage_plan: Vec<UsageDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostingStatus {
    #[default]
    Ready,
    GeneratingVideo,
    VideoReady,
    VideoFailed,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::GeneratingVideo => "generating_video",
            Self::VideoReady => "video_ready",
            Self::VideoFailed => "video_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSlide {
    #[serde(rename = "imageUrl")]
    pub image_url: String,
    pub caption: String,
}

/// Persisted post record created once a session completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub influencer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub content: String,
    pub status: PostingStatus,
    pub prompt: String,
    pub platform: String,
    pub generated_content: String,
    pub image_urls: Vec<String>,
    pub image_slides: Vec<ImageSlide>,
    pub grid_image_url: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Posting {
    pub fn from_generated(
        id: impl Into<String>,
        influencer_id: impl Into<String>,
        owner_id: Option<String>,
        prompt: impl Into<String>,
        post: &GeneratedPost,
    ) -> Self {
        let now = super::now_utc_iso();
        let image_slides = post
            .slide_urls
            .iter()
            .enumerate()
            .map(|(idx, url)| ImageSlide {
                image_url: url.clone(),
                caption: format!("Slide {}", idx + 1),
            })
            .collect();
        Self {
            id: id.into(),
            influencer_id: influencer_id.into(),
            owner_id,
            content: post.caption.clone(),
            status: PostingStatus::Ready,
            prompt: prompt.into(),
            platform: "instagram".to_string(),
            generated_content: post.caption.clone(),
            image_urls: post.slide_urls.clone(),
            image_slides,
            grid_image_url: post.grid_url.clone(),
            source: "orchestrator".to_string(),
            video_url: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = super::now_utc_iso();
    }
}
