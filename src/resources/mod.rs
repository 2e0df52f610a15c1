// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

pub mod cache;
pub mod listing;
pub mod media_type;

pub use self::{
    cache::{DirectoryCache, DirectoryListing, ListingError},
    listing::ListingRequest,
    media_type::MediaType,
};
