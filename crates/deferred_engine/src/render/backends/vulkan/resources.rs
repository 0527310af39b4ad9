//! Buffers, textures and one-time transfer submissions
//!
//! Both wrappers own their memory and release it on drop.

use ash::{vk, Device};

use super::context::{find_memory_type, VulkanResult};
use super::convert;
use crate::render::gfx::{BufferUsage, TextureDesc, TextureDimension};

/// Host-visible, coherent buffer
pub struct VulkanBuffer {
    device: Device,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
}

impl VulkanBuffer {
    /// Allocate a buffer of `size` bytes in memory with `properties`
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> VulkanResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let memory = find_memory_type(memory_properties, requirements.memory_type_bits, properties)
            .and_then(|memory_type_index| {
                let alloc_info = vk::MemoryAllocateInfo::builder()
                    .allocation_size(requirements.size)
                    .memory_type_index(memory_type_index);
                Ok(unsafe { device.allocate_memory(&alloc_info, None)? })
            });
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let buffer = Self {
            device: device.clone(),
            buffer,
            memory,
            size,
        };
        unsafe { device.bind_buffer_memory(buffer.buffer, buffer.memory, 0)? };
        Ok(buffer)
    }

    /// Host-visible buffer for one of the engine's usages
    pub fn for_usage(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        usage: BufferUsage,
        size: vk::DeviceSize,
    ) -> VulkanResult<Self> {
        let usage = match usage {
            BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
            BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
            BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
        };
        Self::new(
            device,
            memory_properties,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Copy `data` to `offset`; the caller has checked the range
    pub fn write(&self, offset: vk::DeviceSize, data: &[u8]) -> VulkanResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        unsafe {
            let ptr = self
                .device
                .map_memory(self.memory, offset, data.len() as vk::DeviceSize, vk::MemoryMapFlags::empty())?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());
            self.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Raw handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for VulkanBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Records `record` into a throwaway primary buffer, submits it and waits
pub fn submit_one_shot(
    device: &Device,
    pool: vk::CommandPool,
    queue: vk::Queue,
    record: impl FnOnce(vk::CommandBuffer),
) -> VulkanResult<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };
    let cmd = buffers[0];

    let result = (|| -> VulkanResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info)? };
        record(cmd);
        unsafe { device.end_command_buffer(cmd)? };

        let submit = vk::SubmitInfo::builder().command_buffers(&buffers).build();
        unsafe {
            device.queue_submit(queue, &[submit], vk::Fence::null())?;
            device.queue_wait_idle(queue)?;
        }
        Ok(())
    })();

    unsafe { device.free_command_buffers(pool, &buffers) };
    result
}

/// Records a full-image layout transition
pub fn transition_layout(
    device: &Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    layers: u32,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: layers,
        })
        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE)
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

/// Queue and pool used for uploads during texture creation
pub struct UploadContext<'a> {
    /// Memory heaps and types of the physical device
    pub memory_properties: &'a vk::PhysicalDeviceMemoryProperties,
    /// Pool the one-shot buffers come from
    pub pool: vk::CommandPool,
    /// Queue the uploads run on
    pub queue: vk::Queue,
    /// Format `Presentation` resolves to
    pub presentation_format: vk::Format,
}

/// Device-local image with its view and sampler
pub struct VulkanTexture {
    device: Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    desc: TextureDesc,
}

impl VulkanTexture {
    /// Create the image, upload `data` if given, and leave it in its resting layout
    pub fn new(device: &Device, upload: &UploadContext<'_>, desc: &TextureDesc, data: Option<&[u8]>) -> VulkanResult<Self> {
        let format = convert::format(desc.format, upload.presentation_format);
        let aspect = convert::aspect(desc.format);
        let layers = desc.layer_count();

        let mut usage = vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST;
        if desc.render_target {
            usage |= if desc.format.is_depth() {
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            };
        }
        let flags = if desc.dimension == TextureDimension::Cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };

        let image_info = vk::ImageCreateInfo::builder()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(layers)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);

        let image = unsafe { device.create_image(&image_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = find_memory_type(
            upload.memory_properties,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .and_then(|memory_type_index| {
            let alloc_info = vk::MemoryAllocateInfo::builder()
                .allocation_size(requirements.size)
                .memory_type_index(memory_type_index);
            Ok(unsafe { device.allocate_memory(&alloc_info, None)? })
        });
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        // From here on drop releases whatever has been created
        let mut texture = Self {
            device: device.clone(),
            image,
            memory,
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            desc: desc.clone(),
        };
        unsafe { device.bind_image_memory(image, memory, 0)? };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(convert::view_type(desc.dimension))
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: layers,
            });
        texture.view = unsafe { device.create_image_view(&view_info, None)? };

        let address_mode = if desc.format.is_depth() || desc.dimension == TextureDimension::Cube {
            vk::SamplerAddressMode::CLAMP_TO_EDGE
        } else {
            vk::SamplerAddressMode::REPEAT
        };
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .max_lod(1.0)
            .border_color(vk::BorderColor::FLOAT_OPAQUE_WHITE);
        texture.sampler = unsafe { device.create_sampler(&sampler_info, None)? };

        let resting = convert::resting_layout(desc.format);
        match data {
            Some(bytes) => {
                let staging = VulkanBuffer::new(
                    device,
                    upload.memory_properties,
                    bytes.len() as vk::DeviceSize,
                    vk::BufferUsageFlags::TRANSFER_SRC,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?;
                staging.write(0, bytes)?;

                let region = vk::BufferImageCopy::builder()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: aspect,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: layers,
                    })
                    .image_extent(vk::Extent3D {
                        width: desc.width,
                        height: desc.height,
                        depth: 1,
                    })
                    .build();

                submit_one_shot(device, upload.pool, upload.queue, |cmd| {
                    transition_layout(
                        device,
                        cmd,
                        image,
                        aspect,
                        layers,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    );
                    unsafe {
                        device.cmd_copy_buffer_to_image(
                            cmd,
                            staging.handle(),
                            image,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                    transition_layout(
                        device,
                        cmd,
                        image,
                        aspect,
                        layers,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        resting,
                    );
                })?;
            }
            None => {
                submit_one_shot(device, upload.pool, upload.queue, |cmd| {
                    transition_layout(device, cmd, image, aspect, layers, vk::ImageLayout::UNDEFINED, resting);
                })?;
            }
        }

        Ok(texture)
    }

    /// Raw image
    pub fn image(&self) -> vk::Image {
        self.image
    }

    /// View covering every layer
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Sampler
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }

    /// Description the texture was created from
    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }
}

impl Drop for VulkanTexture {
    fn drop(&mut self) {
        unsafe {
            if self.sampler != vk::Sampler::null() {
                self.device.destroy_sampler(self.sampler, None);
            }
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

impl std::fmt::Debug for VulkanTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTexture")
            .field("label", &self.desc.label)
            .field("image", &self.image)
            .finish_non_exhaustive()
    }
}

/// Error for a write past the end of a buffer
pub fn check_range(size: vk::DeviceSize, offset: vk::DeviceSize, len: usize) -> Result<(), (u64, u64)> {
    let end = offset.saturating_add(len as u64);
    if end > size {
        Err((end, size))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range(256, 0, 256).is_ok());
        assert!(check_range(256, 192, 64).is_ok());
        assert_eq!(check_range(256, 200, 64), Err((264, 256)));
        assert_eq!(check_range(16, u64::MAX, 1), Err((u64::MAX, 16)));
    }
}
