//! HTTP 网关实现 - 基于 reqwest 的 Komga REST 客户端
//!
//! - Basic / API Key 登录后由 cookie store 保持会话
//! - 状态码映射为语义错误（URL + 截断正文保留用于诊断）
//! - SSE 字节流在这里打开，解析在 `sse` 模块

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::{Credential, InstanceConfig};
use crate::error::{KMReaderError, Result};
use crate::gateway::{
    BookDto, CollectionDto, Gateway, LibraryDto, Page, ReadListDto, SeriesDto, SeriesPageQuery,
};
use crate::storage::entities::BookPage;

/// API Key 认证使用的请求头
const API_KEY_HEADER: &str = "X-API-Key";

/// HTTP 网关
pub struct HttpGateway {
    client: Client,
    base_url: String,
    credential: Credential,
}

impl HttpGateway {
    pub fn new(instance: &InstanceConfig, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .cookie_store(true)
            .build()
            .map_err(|e| KMReaderError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        let base_url = instance.server_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(KMReaderError::InvalidUrl("服务器地址为空".to_string()));
        }

        Ok(Self {
            client,
            base_url,
            credential: instance.credential.clone(),
        })
    }

    /// 登录：用凭证换取会话 cookie（之后的请求由 cookie store 携带）
    pub async fn login(&self) -> Result<()> {
        let url = format!("{}/api/v2/users/me", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(KMReaderError::from)?;
        Self::check_status(&url, response).await?;
        info!("✅ 登录成功: {}", self.base_url);
        Ok(())
    }

    /// 打开 SSE 字节流
    pub async fn sse_stream(
        &self,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>> {
        let url = format!("{}/sse/v1/events", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(KMReaderError::from)?;
        let response = Self::check_status(&url, response).await?;
        info!("🔌 SSE 已连接: {}", url);
        Ok(response.bytes_stream())
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.credential {
            Credential::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credential::ApiKey(key) => builder.header(API_KEY_HEADER, key),
        }
    }

    async fn check_status(url: &str, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            debug!("🔒 请求未授权: {}", url);
        }
        Err(KMReaderError::from_status(status.as_u16(), url, &body))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorized(self.client.get(&url))
            .query(query)
            .send()
            .await
            .map_err(KMReaderError::from)?;
        let response = Self::check_status(&url, response).await?;
        let body = response.bytes().await.map_err(KMReaderError::from)?;
        serde_json::from_slice(&body).map_err(|e| KMReaderError::Decode {
            message: e.to_string(),
            url: Some(url),
        })
    }

    async fn get_bytes(&self, path: &str) -> Result<Bytes> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(KMReaderError::from)?;
        let response = Self::check_status(&url, response).await?;
        response.bytes().await.map_err(KMReaderError::from)
    }

    fn page_query(page: usize, size: usize) -> Vec<(&'static str, String)> {
        vec![("page", page.to_string()), ("size", size.to_string())]
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn libraries(&self) -> Result<Vec<LibraryDto>> {
        self.get_json("/api/v1/libraries", &[]).await
    }

    async fn series_page(&self, query: &SeriesPageQuery) -> Result<Page<SeriesDto>> {
        let mut params = Self::page_query(query.page, query.size);
        for id in &query.library_ids {
            params.push(("library_id", id.clone()));
        }
        if let Some(sort) = &query.sort {
            params.push(("sort", sort.clone()));
        }
        if let Some(search) = &query.search {
            if !search.is_empty() {
                params.push(("search", search.clone()));
            }
        }
        self.get_json("/api/v1/series", &params).await
    }

    async fn new_series_page(
        &self,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let mut params = Self::page_query(page, size);
        for id in library_ids {
            params.push(("library_id", id.clone()));
        }
        self.get_json("/api/v1/series/new", &params).await
    }

    async fn updated_series_page(
        &self,
        library_ids: &[String],
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let mut params = Self::page_query(page, size);
        for id in library_ids {
            params.push(("library_id", id.clone()));
        }
        self.get_json("/api/v1/series/updated", &params).await
    }

    async fn series(&self, series_id: &str) -> Result<SeriesDto> {
        self.get_json(&format!("/api/v1/series/{}", series_id), &[])
            .await
    }

    async fn series_books_page(
        &self,
        series_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        let params = Self::page_query(page, size);
        self.get_json(&format!("/api/v1/series/{}/books", series_id), &params)
            .await
    }

    async fn book(&self, book_id: &str) -> Result<BookDto> {
        self.get_json(&format!("/api/v1/books/{}", book_id), &[])
            .await
    }

    async fn collections_page(
        &self,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<CollectionDto>> {
        let mut params = Self::page_query(page, size);
        if let Some(search) = search {
            if !search.is_empty() {
                params.push(("search", search.to_string()));
            }
        }
        self.get_json("/api/v1/collections", &params).await
    }

    async fn collection(&self, collection_id: &str) -> Result<CollectionDto> {
        self.get_json(&format!("/api/v1/collections/{}", collection_id), &[])
            .await
    }

    async fn collection_series_page(
        &self,
        collection_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<SeriesDto>> {
        let params = Self::page_query(page, size);
        self.get_json(
            &format!("/api/v1/collections/{}/series", collection_id),
            &params,
        )
        .await
    }

    async fn read_lists_page(
        &self,
        page: usize,
        size: usize,
        search: Option<&str>,
    ) -> Result<Page<ReadListDto>> {
        let mut params = Self::page_query(page, size);
        if let Some(search) = search {
            if !search.is_empty() {
                params.push(("search", search.to_string()));
            }
        }
        self.get_json("/api/v1/readlists", &params).await
    }

    async fn read_list(&self, read_list_id: &str) -> Result<ReadListDto> {
        self.get_json(&format!("/api/v1/readlists/{}", read_list_id), &[])
            .await
    }

    async fn read_list_books_page(
        &self,
        read_list_id: &str,
        page: usize,
        size: usize,
    ) -> Result<Page<BookDto>> {
        let params = Self::page_query(page, size);
        self.get_json(&format!("/api/v1/readlists/{}/books", read_list_id), &params)
            .await
    }

    async fn book_pages(&self, book_id: &str) -> Result<Vec<BookPage>> {
        self.get_json(&format!("/api/v1/books/{}/pages", book_id), &[])
            .await
    }

    async fn book_page(&self, book_id: &str, number: i64) -> Result<Bytes> {
        self.get_bytes(&format!("/api/v1/books/{}/pages/{}", book_id, number))
            .await
    }

    async fn book_file(&self, book_id: &str) -> Result<Bytes> {
        self.get_bytes(&format!("/api/v1/books/{}/file", book_id))
            .await
    }

    async fn update_read_progress(&self, book_id: &str, page: i64, completed: bool) -> Result<()> {
        let url = format!("{}/api/v1/books/{}/read-progress", self.base_url, book_id);
        let body = serde_json::json!({ "page": page, "completed": completed });
        let response = self
            .authorized(self.client.patch(&url))
            .json(&body)
            .send()
            .await
            .map_err(KMReaderError::from)?;
        Self::check_status(&url, response).await?;
        Ok(())
    }
}
